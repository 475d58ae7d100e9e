use uuid::Uuid;

/// Generate a fresh 128-bit random identifier rendered as 32 lowercase hex
/// characters. Backed by the OS CSPRNG via uuid v4.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

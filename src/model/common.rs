use uuid::Uuid;

pub type Id = String;

/// Generate a URL-safe identifier (32 hex chars).
pub fn generate_id() -> Id {
    Uuid::new_v4().simple().to_string()
}

use uuid::Uuid;

/// Generate a correlation id for one tunneled connection
pub fn generate_connection_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate an identifier for a registered worker session
pub fn generate_worker_id() -> String {
    format!("wrk_{}", Uuid::new_v4())
}

mod addr;
mod headers;
mod id;

pub use addr::{parse_destination, resolve_remote_addr};
pub use headers::{X_FORWARDED_FOR, first_forwarded_ip};
pub use id::{generate_connection_id, generate_worker_id};

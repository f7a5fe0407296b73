pub mod certificates;
pub mod tls;

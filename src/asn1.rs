pub mod oid;
pub mod tsp;

// Storage adapters for the snapshot contract in `queue::store`.

pub mod file;

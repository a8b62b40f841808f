pub mod lock_rank;
pub mod monitor;

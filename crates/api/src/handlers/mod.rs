pub mod health;
pub mod jobs;
pub mod pool;
pub mod test_runs;
pub mod workers;

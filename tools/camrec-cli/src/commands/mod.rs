pub mod cameras;
pub mod check;
pub mod record;
pub mod segments;
pub mod worker;

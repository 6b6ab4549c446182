pub mod balance;
pub mod clean;
pub mod folds;
pub mod inspect;
pub mod pipeline;
pub mod train;

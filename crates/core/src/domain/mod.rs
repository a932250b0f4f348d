pub mod conversation;
pub mod inventory;
pub mod next_step;

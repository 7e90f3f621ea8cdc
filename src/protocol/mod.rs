pub mod message;
pub mod receive_state;
pub mod send_state;
pub mod coordinator;

pub mod console;
pub mod sip;
pub mod task;

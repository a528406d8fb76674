pub mod system;
pub mod ws;

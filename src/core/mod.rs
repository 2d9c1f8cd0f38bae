pub mod model;
pub mod textio;

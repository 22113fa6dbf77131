pub mod generate;
pub mod listmodels;
pub mod pull;
pub mod status;

pub mod cli;
pub mod config;
pub mod converter;
pub mod locate;
pub mod pipeline;
pub mod policy;
pub mod report;
pub mod response;
pub mod server;
pub mod source;
pub mod util;

pub mod auction_log;
pub mod op_logger;
pub mod runtime_logger;

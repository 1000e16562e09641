pub mod allocation;
pub mod expiry_sweeper;
pub mod promotions;
pub mod stock_ledger;

pub use expiry_sweeper::ExpirySweeper;
pub use stock_ledger::StockLedgerService;

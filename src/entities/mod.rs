pub mod batch;
pub mod product;
pub mod promotion;
pub mod stock_movement;

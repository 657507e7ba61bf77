pub mod controller;
pub mod security;

pub use controller::{Services, TaxPoynt};

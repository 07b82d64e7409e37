pub mod addr_map;
pub mod atomic;
pub mod controller;
pub mod policy;
pub mod scratchpad;

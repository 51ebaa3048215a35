#![allow(dead_code)]

pub mod helpers;
pub mod mock_pool;

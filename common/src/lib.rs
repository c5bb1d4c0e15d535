#![no_std]

pub mod physical;

#![cfg_attr(not(test), no_std)]

//! Cross-crate integration scenarios: the full stack (heap, event loop,
//! timer plant, MAC, poll machine) wired together the way a host would
//! wire it, driven through a scripted PHY.

#[cfg(test)]
mod stack_tests;

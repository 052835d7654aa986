//! Integration tests for turium

mod conditions;
mod config_loading;
mod frame_relay;
mod sandbox_protocol;
mod selector_chain;
mod test_utils;
mod token_store;

//! Integration tests: the engine wired to scripted in-memory bookmakers.

mod automation;
mod mock_bookmaker;
mod saga;
mod scanning;

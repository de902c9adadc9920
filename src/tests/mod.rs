//! Component tests against a scripted backend.
mod mock;

mod funding;

pub mod artifact;
pub mod imported_bookmark;
pub mod progress_event;
pub mod task;

#[cfg(test)]
pub(crate) mod test_utils;

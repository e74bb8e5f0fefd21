mod async_calls;
mod blocking_calls;
mod failures;

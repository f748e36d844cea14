#[cfg(unix)]
mod batch_flow;

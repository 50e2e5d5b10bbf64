pub mod buffer;
pub mod history;
pub mod panel;
pub mod presenter;

#[cfg(test)]
mod test;

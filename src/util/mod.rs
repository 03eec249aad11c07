//! Small shared building blocks

pub mod bit_packed_array;
pub mod interrupt;

pub use bit_packed_array::{BitPackedArray, PackingMode};
pub use interrupt::{Interrupt, Interrupted};

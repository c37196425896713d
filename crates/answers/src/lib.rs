//! Answer domain module.
//!
//! Durable reservations that make answer generation idempotent, and the
//! immutable answer records themselves. Pure domain logic: no IO, no HTTP,
//! no storage.

pub mod answer;
pub mod reservation;

pub use answer::Answer;
pub use reservation::{AnswerReservation, ReservationKey, ReservationStatus};

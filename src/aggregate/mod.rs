//! Pure aggregation over already-read source rows.
//!
//! Every function takes the window it aggregates for and ignores rows
//! outside it, so callers can hand over loosely filtered reads.

pub mod anthro;
pub mod attendance;
pub mod nutrition;

pub use nutrition::{FoodCatalog, MealTotalsPolicy};

// Stage machine for order lifecycle tracking.

pub mod stages;

pub use stages::Stage;

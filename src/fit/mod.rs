//! Robust curve fitting of the log flux ratio.
//!
//! Two regimes share one rejection loop ([`reject::iterative_fit`]):
//! a global polynomial ([`poly`]) and a breakpoint B-spline ([`bspline`]).

pub mod bspline;
pub mod poly;
pub mod reject;

pub use bspline::{breakpoint_spacing, fit_bspline, BsplineFit, BsplineFitConfig};
pub use poly::{fit_polynomial, PolyFit, PolyFitConfig, Polynomial};
pub use reject::{Rejection, ResidualScale, RobustFit};

//! Catalog loading, constraint application, and recipe planning for container image builds.

mod config;
mod constraint;
mod error;
mod graph;
mod image;
mod planner;
mod repo;

pub use config::Config;
pub use constraint::{Constraint, ConstraintStore, DepOp, Scope, Target};
pub use error::{Error, Result};
pub use graph::ImageGraph;
pub use image::{ConstraintKind, Image, Mutation};
pub use planner::RecipePlanner;
pub use repo::{Facets, ImageRepo};

pub mod action;
pub mod condition;
pub mod correlation;
pub mod decision;
pub mod item;
pub mod job;
pub mod routing;
pub mod rule;

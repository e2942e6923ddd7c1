//! Message templates
//!
//! `renderer` performs strict placeholder substitution; `catalog` stores,
//! validates and resolves templates per clinician, channel and category.

pub mod catalog;
pub mod renderer;

pub use catalog::{CreateTemplate, TemplateCatalog, UpdateTemplate};
pub use renderer::{
    placeholders, render, render_template, RenderError, RenderedTemplate, VARIABLE_CATALOG,
};

mod correlation;
mod template;

pub use correlation::{average_ranks, kendall_tau, pearson, spearman, Correlation};
pub use template::{substitute, TemplateError};

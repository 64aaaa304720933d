//! Appends the rule that stamps every target with the name of the scrape
//! job it belongs to.
//!
//! User relabel rules are free to rewrite or drop `job`, so the receiver
//! cannot rely on it to attribute samples. The injected rule runs after all
//! user rules and writes the job name into [`SCRAPE_JOB_LABEL`], which the
//! sample bridge reads back when a scrape is committed.

use scrapeline_model::{INSTANCE_LABEL, SCRAPE_JOB_LABEL};

use super::{RelabelAction, RelabelConfig, RelabelRegex};
use crate::config::ScrapeJobConfig;

/// Builds the rule for one job.
///
/// The source is `instance`, which every scraped target has, and the regex
/// matches any value (empty included), so the rule always fires. `$` in the
/// job name is escaped so it is written literally instead of being expanded
/// as a capture reference.
pub fn scrape_job_rule(job_name: &str) -> RelabelConfig {
    RelabelConfig {
        source_labels: vec![INSTANCE_LABEL.to_string()],
        regex: RelabelRegex::match_all(),
        target_label: SCRAPE_JOB_LABEL.to_string(),
        replacement: job_name.replace('$', "$$"),
        action: RelabelAction::Replace,
        ..RelabelConfig::default()
    }
}

/// Appends [`scrape_job_rule`] to every job's relabel rules, in place.
pub fn inject_scrape_job_label(jobs: &mut [ScrapeJobConfig]) {
    for job in jobs.iter_mut() {
        let rule = scrape_job_rule(&job.job_name);
        job.relabel_configs.push(rule);
    }
}

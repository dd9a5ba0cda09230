use super::{Applier, ApplyContext};
use crate::session::{Action, Probe};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;

/// Scheduled jobs in the service user's crontab. A job counts as present
/// when any line carries its marker; the schedule itself is never parsed.
pub struct CronApplier;

#[async_trait]
impl Applier for CronApplier {
    fn kind(&self) -> &'static str {
        "cron"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let jobs = &ctx.registry.manifest().scheduled_jobs;
        if jobs.is_empty() {
            return Ok(());
        }

        let mut current = ctx.query(&[Probe::Crontab]).await?;
        let crontab = String::from_utf8_lossy(&current.take(0).into_content().unwrap_or_default()).into_owned();

        let mut missing = Vec::new();
        for job in jobs {
            if crontab.lines().any(|line| line.contains(&job.marker)) {
                ctx.correct(format!("cron:{}", job.marker));
            } else {
                missing.push(job);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let mut updated = crontab;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        for job in &missing {
            updated.push_str(&job.crontab_line());
            updated.push('\n');
        }

        match ctx.commit(vec![Action::InstallCrontab(updated.into_bytes())]).await {
            Ok(()) => {
                for job in missing {
                    ctx.fixed(format!("cron:{}", job.marker));
                }
            }
            Err(e) => {
                for job in missing {
                    ctx.error(format!("cron:{}", job.marker), &e);
                }
            }
        }
        Ok(())
    }
}

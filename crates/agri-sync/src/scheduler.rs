//! Scheduled job runner: fires configured HTTP calls on cron schedules.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// One entry of the jobs file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    pub schedule: String,
    #[serde(default)]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl ScheduledJob {
    /// Six-field expression with seconds; classic five-field ones fire at second 0.
    pub fn cron_expression(&self) -> String {
        let expr = self.schedule.trim();
        if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        }
    }

    pub fn http_method(&self) -> Result<Method> {
        let method = self.method.trim();
        if method.is_empty() {
            return Ok(Method::GET);
        }
        Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("job {}: invalid HTTP method '{method}'", self.name))
    }
}

pub async fn load_jobs(path: &Path) -> Result<Vec<ScheduledJob>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading job config {}", path.display()))?;
    let jobs: Vec<ScheduledJob> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing job config {}", path.display()))?;
    Ok(jobs)
}

/// Sends the job's request once. A JSON body is sent with its content type.
pub async fn run_job(client: &reqwest::Client, job: &ScheduledJob) -> Result<StatusCode> {
    let method = job.http_method()?;
    let mut request = client.request(method, &job.url);
    if let Some(body) = &job.body {
        request = request.json(body);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("job {}: request to {} failed", job.name, job.url))?;
    Ok(response.status())
}

/// Registers every valid job on a new scheduler; invalid ones are logged and
/// skipped. The scheduler is returned unstarted.
pub async fn build_scheduler(
    jobs: Vec<ScheduledJob>,
    client: reqwest::Client,
) -> Result<(JobScheduler, usize)> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let mut registered = 0usize;

    for job in jobs {
        let name = job.name.clone();
        match register(&scheduler, job, client.clone()).await {
            Ok(()) => {
                info!(job = %name, "scheduled job");
                registered += 1;
            }
            Err(err) => warn!(job = %name, error = %format!("{err:#}"), "skipping job"),
        }
    }

    Ok((scheduler, registered))
}

async fn register(scheduler: &JobScheduler, job: ScheduledJob, client: reqwest::Client) -> Result<()> {
    if job.url.trim().is_empty() {
        bail!("job {} has no url", job.name);
    }
    job.http_method()?;
    let expression = job.cron_expression();
    let job = Arc::new(job);

    let cron_job = Job::new_async(expression.as_str(), move |_uuid, _scheduler| {
        let job = job.clone();
        let client = client.clone();
        Box::pin(async move {
            info!(job = %job.name, "running job");
            match run_job(&client, &job).await {
                Ok(status) => info!(job = %job.name, %status, "job finished"),
                Err(err) => error!(job = %job.name, error = %format!("{err:#}"), "job failed"),
            }
        })
    })
    .with_context(|| format!("invalid schedule '{expression}'"))?;

    scheduler.add(cron_job).await.context("adding scheduler job")?;
    Ok(())
}

//! Staffing dashboard back-office sketch.
//!
//! Builds a single admission pool around an in-memory stand-in for the backend client at
//! startup, and hands it to the repository layer explicitly. Configuration is read from an
//! optional `dashboard.yaml` file and `CREW__*` environment variables, such as
//! `CREW__POOL__MAX_CONCURRENT=4`.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crewdb::{
    batch::{chunked, DEFAULT_INSERT_CHUNK},
    AdmissionError, LoggingConfig, Pool, ServiceConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Dashboard-specific configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
struct DashboardConfig {
    /// Simulated backend round-trip latency.
    #[serde(default, with = "humantime_serde")]
    latency: Option<Duration>,
    /// Number of crew records to import on startup.
    #[serde(default)]
    import_crew: usize,
}

#[derive(Debug, Error)]
enum DashboardError {
    #[error("project {0} not found")]
    NotFound(String),
    #[error("crew member {0} is already booked")]
    Booked(String),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

#[derive(Clone, Debug, Serialize)]
struct Project {
    id: String,
    title: String,
    status: String,
    crew_count: usize,
}

#[derive(Clone, Debug, Serialize)]
struct CrewMember {
    id: String,
    name: String,
    project: Option<String>,
}

/// In-memory stand-in for the remote backend client.
struct BackendClient {
    latency: Duration,
    projects: Mutex<BTreeMap<String, Project>>,
    crew: Mutex<BTreeMap<String, CrewMember>>,
}

impl BackendClient {
    fn new(latency: Duration) -> Self {
        let projects = (1..=3)
            .map(|n| {
                let id = format!("p{n}");
                let project = Project {
                    id: id.clone(),
                    title: format!("Event #{n}"),
                    status: "planning".into(),
                    crew_count: 0,
                };
                (id, project)
            })
            .collect();
        Self {
            latency,
            projects: Mutex::new(projects),
            crew: Mutex::new(BTreeMap::new()),
        }
    }

    async fn round_trip(&self) {
        tokio::time::sleep(self.latency).await;
    }

    async fn select_project(&self, id: &str) -> Result<Project, DashboardError> {
        self.round_trip().await;
        self.projects
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| DashboardError::NotFound(id.into()))
    }

    async fn insert_crew(&self, rows: Vec<CrewMember>) -> Result<usize, DashboardError> {
        self.round_trip().await;
        let mut crew = self.crew.lock();
        let inserted = rows.len();
        crew.extend(rows.into_iter().map(|row| (row.id.clone(), row)));
        Ok(inserted)
    }

    async fn book(&self, member: &str, project: &str) -> Result<(), DashboardError> {
        self.round_trip().await;
        let mut crew = self.crew.lock();
        let row = crew
            .get_mut(member)
            .ok_or_else(|| DashboardError::NotFound(member.into()))?;
        if row.project.is_some() {
            return Err(DashboardError::Booked(member.into()));
        }
        row.project = Some(project.into());
        Ok(())
    }

    async fn bump_crew_count(&self, project: &str) -> Result<usize, DashboardError> {
        self.round_trip().await;
        let mut projects = self.projects.lock();
        let row = projects
            .get_mut(project)
            .ok_or_else(|| DashboardError::NotFound(project.into()))?;
        row.crew_count += 1;
        Ok(row.crew_count)
    }
}

/// Data access for the dashboard views, all of it under admission control.
#[derive(Clone)]
struct Repository {
    pool: Pool<BackendClient>,
}

impl Repository {
    async fn project(&self, id: &str) -> Result<Project, DashboardError> {
        let id = id.to_owned();
        self.pool
            .query(|db| async move { db.select_project(&id).await })
            .await
    }

    async fn import_crew(&self, rows: Vec<CrewMember>) -> Result<usize, DashboardError> {
        let ops = chunked(rows, DEFAULT_INSERT_CHUNK)
            .map(|chunk| move |db: Arc<BackendClient>| async move { db.insert_crew(chunk).await });
        Ok(self.pool.batch(ops).await?.into_iter().sum())
    }

    /// Book a crew member and bump the project head count.
    ///
    /// Not atomic: if bumping the count fails, the booking stays.
    async fn assign(&self, member: &str, project: &str) -> Result<usize, DashboardError> {
        let (member, project) = (member.to_owned(), project.to_owned());
        self.pool
            .transaction(|db| async move {
                db.book(&member, &project).await?;
                db.bump_crew_count(&project).await
            })
            .await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::<DashboardConfig>::builder()
        .with_optional_file("dashboard")
        .with_env("CREW")
        .build()?;
    let logging = if config.logging.subscribers.is_empty() {
        LoggingConfig::for_dev()
    } else {
        config.logging.clone()
    };
    let _log_guards = logging.init()?;

    let client = BackendClient::new(config.service.latency.unwrap_or(Duration::from_millis(20)));
    let pool = Pool::new(client, config.pool.clone());
    let _monitor = pool.spawn_monitor();
    let repo = Repository { pool: pool.clone() };

    let import = config.service.import_crew.max(12);
    let rows = (0..import)
        .map(|n| CrewMember {
            id: format!("c{n}"),
            name: format!("Crew member {n}"),
            project: None,
        })
        .collect();
    let imported = repo.import_crew(rows).await?;
    info!(imported, "crew imported");

    let views = ["p1", "p2", "p3", "p4"].map(|id| {
        let repo = repo.clone();
        tokio::spawn(async move { repo.project(id).await })
    });
    for view in views {
        match view.await? {
            Ok(project) => info!(id = %project.id, title = %project.title, "loaded project"),
            Err(err) => warn!(%err, "project view failed"),
        }
    }

    for (member, project) in [("c0", "p1"), ("c1", "p1"), ("c0", "p2")] {
        match repo.assign(member, project).await {
            Ok(count) => info!(member, project, count, "crew assigned"),
            Err(err) => warn!(member, project, %err, "assignment failed"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&pool.stats())?);
    Ok(())
}

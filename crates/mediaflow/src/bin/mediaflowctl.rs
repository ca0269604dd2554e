use anyhow::Context;
use mediaflow::config::Config;
use mediaflow::db::{make_pool, run_migrations};
use mediaflow::jobs::{
    job_types, DefaultsTable, Job, JobFilter, JobStatus, JobsRepo, NewJob, Payload, ZombieReaper,
};
use serde_json::json;
use sqlx::SqlitePool;
use std::env;
use std::time::Duration;

const USAGE: &str = "mediaflowctl <command>\n\
     Commands:\n\
     - migrate\n\
     - reset\n\
     - seed <n>\n\
     - list [status] [limit]\n\
     - show <job_id>\n\
     - stats\n\
     - cancel <job_id>\n\
     - sweep\n\
     - kill-zombies\n\
     - replay <job_id>\n\
     \n\
     Uses MEDIAFLOW_DATABASE_URL or DATABASE_URL (default sqlite://mediaflow.db).\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let cfg = Config::from_env()?;
    let pool = make_pool(&cfg.database_url, 2)
        .await
        .with_context(|| format!("opening {}", cfg.database_url))?;
    let repo = JobsRepo::new(pool.clone());

    match args[1].as_str() {
        "migrate" => {
            run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "reset" => reset(&pool).await?,
        "seed" => {
            let n: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(&repo, n).await?;
        }
        "list" => {
            let status = args
                .get(2)
                .map(|s| s.parse::<JobStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let limit: i64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(50);
            list(&repo, status, limit).await?;
        }
        "show" => {
            let id = parse_id(&args, "show")?;
            show(&repo, id).await?;
        }
        "stats" => stats(&repo).await?,
        "cancel" => {
            let id = parse_id(&args, "cancel")?;
            match repo.get_job(id).await? {
                None => println!("job {id} not found"),
                Some(job) if !job.status.is_cancellable() => {
                    println!("job {id} is {} and cannot be cancelled", job.status)
                }
                Some(_) if repo.cancel(id).await? => println!("job {id} cancelled"),
                Some(_) => println!("job {id} was picked up before it could be cancelled"),
            }
        }
        "sweep" => {
            let reaper = ZombieReaper::new(
                repo.clone(),
                Duration::from_secs(cfg.zombie_threshold_secs),
            );
            let ids = reaper.sweep().await?;
            println!("marked {} zombie(s): {ids:?}", ids.len());
        }
        "kill-zombies" => {
            let ids = repo.force_kill_zombies().await?;
            println!("force-killed {} zombie(s): {ids:?}", ids.len());
        }
        "replay" => {
            let id = parse_id(&args, "replay")?;
            let new_id = repo.replay_job(id).await?;
            println!("job {id} replayed as {new_id}");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn parse_id(args: &[String], cmd: &str) -> anyhow::Result<i64> {
    let raw = args
        .get(2)
        .with_context(|| format!("usage: mediaflowctl {cmd} <job_id>"))?;
    raw.parse()
        .with_context(|| format!("job id must be an integer, got {raw:?}"))
}

async fn reset(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM job_queue").execute(pool).await?;
    sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'job_queue'")
        .execute(pool)
        .await?;

    println!("reset OK");
    Ok(())
}

async fn seed(repo: &JobsRepo, n: i64) -> anyhow::Result<()> {
    let defaults = DefaultsTable::media_library();

    for i in 0..n {
        let (job_type, payload) = match i % 4 {
            0 => (
                job_types::CHANNEL_DOWNLOAD,
                json!({ "channel_url": format!("https://media.example/channel/{i}") }),
            ),
            1 => (
                job_types::PLAYLIST_DOWNLOAD,
                json!({ "playlist_url": format!("https://media.example/playlist/{i}"), "max_items": 10 }),
            ),
            2 => (
                job_types::METADATA_EXTRACTION,
                json!({ "media_path": format!("library/track-{i}.mp3") }),
            ),
            _ => (job_types::DATABASE_BACKUP, json!({ "label": format!("seed-{i}") })),
        };

        let d = defaults.get(job_type);
        let payload: Payload = match payload {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        };
        let id = repo
            .insert(&NewJob {
                priority: d.priority,
                max_retries: d.max_retries,
                timeout_seconds: d.timeout_seconds,
                ..NewJob::new(job_type, payload)
            })
            .await?;

        println!("+ inserted job {job_type} id={id}");
    }
    Ok(())
}

async fn list(repo: &JobsRepo, status: Option<JobStatus>, limit: i64) -> anyhow::Result<()> {
    let filter = JobFilter {
        status,
        job_type: None,
    };
    let jobs = repo.list_jobs(&filter, limit, 0).await?;

    println!(
        "{:>6}  {:<22} {:<12} {:>4} {:>7}  {}",
        "id", "type", "status", "prio", "retries", "created"
    );
    for job in &jobs {
        println!(
            "{:>6}  {:<22} {:<12} {:>4} {:>3}/{:<3}  {}",
            job.id,
            job.job_type,
            job.status,
            job.priority,
            job.retry_count,
            job.max_retries,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("({} shown)", jobs.len());
    Ok(())
}

async fn show(repo: &JobsRepo, id: i64) -> anyhow::Result<()> {
    let Some(job) = repo.get_job(id).await? else {
        println!("job {id} not found");
        return Ok(());
    };

    print_job(&job)?;
    Ok(())
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    println!("=== job {} ===", job.id);
    println!("type:        {}", job.job_type);
    println!("status:      {}", job.status);
    println!("priority:    {}", job.priority);
    println!("retries:     {}/{}", job.retry_count, job.max_retries);
    println!("created:     {}", job.created_at);
    if let Some(t) = job.started_at {
        println!("started:     {t}");
    }
    if let Some(t) = job.completed_at {
        println!("completed:   {t}");
    }
    if let Some(t) = job.next_retry_at {
        println!("next retry:  {t}");
    }
    if let Some(w) = &job.worker_id {
        println!("worker:      {w}");
    }
    if let Some(t) = job.timeout_seconds {
        println!("timeout:     {t}s");
    }
    if let Some(p) = job.parent_job_id {
        println!("parent:      {p}");
    }
    if let Some(e) = &job.error_message {
        println!("error:       {e}");
    }
    if let Some(ft) = job.failure_type {
        println!("failure:     {ft}");
        println!("action:      {}", ft.suggested_action());
    }
    if let Some(r) = &job.dead_letter_reason {
        println!("dead letter: {r}");
    }
    if let Some(p) = &job.log_file_path {
        println!("log:         {p}");
    }
    println!("payload:\n{}", serde_json::to_string_pretty(&job.payload.0)?);
    if let Some(tb) = &job.last_error_traceback {
        println!("traceback:\n{tb}");
    }
    Ok(())
}

async fn stats(repo: &JobsRepo) -> anyhow::Result<()> {
    println!("by status:");
    for (status, n) in repo.status_counts().await? {
        println!("  {status:<12} {n}");
    }
    println!("by type:");
    for (job_type, n) in repo.type_counts().await? {
        println!("  {job_type:<22} {n}");
    }
    Ok(())
}

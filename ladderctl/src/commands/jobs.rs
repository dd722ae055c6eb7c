use ladder_core::{Job, JobStatus, Profile};
use serde_json::json;

use crate::{AppContext, AppError, JobCommands, JobSubmitArgs, OutputFormat, Result};

pub fn run(context: &AppContext, command: &JobCommands) -> Result<()> {
    match command {
        JobCommands::Submit(args) => submit(context, args),
        JobCommands::Status(arg) => status(context, arg.id),
        JobCommands::List(args) => list(context, args),
        JobCommands::Cancel(arg) => cancel(context, arg.id),
        JobCommands::Errors(arg) => errors(context, arg.id),
        JobCommands::Artifacts(arg) => artifacts(context, arg.id),
    }
}

fn submit(context: &AppContext, args: &JobSubmitArgs) -> Result<()> {
    let profile = parse_profile(args)?;

    // Lookup-then-insert; the uniqueness constraint on the key settles
    // any race in favor of the first writer.
    if let Some(key) = &args.idempotency_key {
        if let Some(existing) = context.store.find_by_idempotency_key(key)? {
            return print_job(context, &existing);
        }
    }

    let mut job = Job::new(args.bucket.clone(), args.key.clone(), profile);
    job.video_id = args.video_id;
    job.idempotency_key = args.idempotency_key.clone();
    job.priority = args.priority;

    match context.store.create(&job) {
        Ok(()) => print_job(context, &job),
        Err(ladder_core::StoreError::IdempotencyConflict) => {
            let key = args.idempotency_key.as_deref().unwrap_or_default();
            let existing = context
                .store
                .find_by_idempotency_key(key)?
                .ok_or_else(|| AppError::MissingResource(format!("job for key {key}")))?;
            print_job(context, &existing)
        }
        Err(err) => Err(err.into()),
    }
}

fn parse_profile(args: &JobSubmitArgs) -> Result<Profile> {
    match (&args.profile, &args.profile_file) {
        (Some(_), Some(_)) => Err(AppError::InvalidArgument(
            "--profile and --profile-file are mutually exclusive".into(),
        )),
        (Some(inline), None) => Ok(serde_json::from_str(inline)?),
        (None, Some(path)) => {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        }
        (None, None) => Ok(Profile::default()),
    }
}

fn status(context: &AppContext, id: uuid::Uuid) -> Result<()> {
    let job = context
        .store
        .get(id)?
        .ok_or_else(|| AppError::MissingResource(format!("job {id}")))?;
    print_job(context, &job)
}

fn list(context: &AppContext, args: &crate::JobListArgs) -> Result<()> {
    let status: JobStatus = args
        .status
        .parse()
        .map_err(AppError::InvalidArgument)?;
    let jobs = context.store.list_by_status(status, args.limit)?;
    match context.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Text => {
            for job in jobs {
                println!(
                    "{}  {:<9}  {:>3}%  {}  s3://{}/{}",
                    job.id,
                    job.status.as_str(),
                    job.overall_progress,
                    job.current_stage.map(|s| s.as_str()).unwrap_or("-"),
                    job.source_bucket,
                    job.source_key
                );
            }
        }
    }
    Ok(())
}

fn cancel(context: &AppContext, id: uuid::Uuid) -> Result<()> {
    let accepted = context.store.request_cancel(id)?;
    match context.format {
        OutputFormat::Json => println!("{}", json!({ "id": id, "accepted": accepted })),
        OutputFormat::Text => {
            if accepted {
                println!("cancellation requested for {id}");
            } else {
                println!("job {id} is not cancellable");
            }
        }
    }
    Ok(())
}

fn errors(context: &AppContext, id: uuid::Uuid) -> Result<()> {
    let errors = context.store.errors_for_job(id)?;
    match context.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&errors)?),
        OutputFormat::Text => {
            for error in errors {
                println!(
                    "{}  {}  {:<9}  {}  attempt {}  {}",
                    error.created_at.to_rfc3339(),
                    error.stage.as_str(),
                    error.class.as_str(),
                    error.code.as_str(),
                    error.attempt,
                    error.message
                );
            }
        }
    }
    Ok(())
}

fn artifacts(context: &AppContext, id: uuid::Uuid) -> Result<()> {
    let artifacts = context.store.artifacts_for_job(id)?;
    match context.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&artifacts)?),
        OutputFormat::Text => {
            for artifact in artifacts {
                println!(
                    "{:<13}  s3://{}/{}  {}",
                    artifact.artifact_type.as_str(),
                    artifact.bucket,
                    artifact.key,
                    artifact
                        .size_bytes
                        .map(|s| format!("{s} bytes"))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn print_job(context: &AppContext, job: &Job) -> Result<()> {
    match context.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Text => {
            println!("id:       {}", job.id);
            println!("status:   {}", job.status.as_str());
            println!(
                "stage:    {} ({}%)",
                job.current_stage.map(|s| s.as_str()).unwrap_or("-"),
                job.stage_progress
            );
            println!("overall:  {}%", job.overall_progress);
            println!("source:   s3://{}/{}", job.source_bucket, job.source_key);
            if let Some(video_id) = job.video_id {
                println!("video:    {video_id}");
            }
            if let Some(finished_at) = job.finished_at {
                println!("finished: {}", finished_at.to_rfc3339());
            }
        }
    }
    Ok(())
}

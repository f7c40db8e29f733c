use crate::{
    app::App,
    catalog::{CoursePreview, CourseRecord},
    config, folder,
    integrity::IntegrityCheckResult,
    logging,
    progress::{ImportEvent, ProgressSink, SilentSink},
};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::{path::PathBuf, sync::Mutex};
use time::OffsetDateTime;
use tracing::error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "coursekeeper", version, about = "Local course library manager")]
pub struct Cli {
    /// Where config, catalog and icons live.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import course archives (.zip, .tar.zst, .tzst) into the root folder.
    Import {
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },
    /// Add a course directory that already sits in the root folder.
    Add { dir_name: String },
    /// Look for new or updated course directories in the root folder.
    Scan {
        /// Add everything the scan finds.
        #[arg(long)]
        import: bool,
    },
    /// List courses.
    List {
        /// Show removed courses instead.
        #[arg(long)]
        inactive: bool,
    },
    /// Show one course with its progress.
    Show { course_id: String },
    /// Recently opened courses.
    Recent {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Hide a course; re-importing it brings it back.
    Deactivate { course_id: String },
    /// Delete a course, its progress and its folder for good.
    Delete { course_id: String },
    /// Mark a lesson as completed.
    Mark {
        course_id: String,
        lesson_id: String,
        /// Mark as not completed instead.
        #[arg(long)]
        undo: bool,
    },
    /// Manage the course root folder.
    Root {
        #[command(subcommand)]
        action: RootAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum RootAction {
    Show,
    Set { path: PathBuf },
    Clear,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(logging::level_for(cli.verbose, cli.quiet));

    let data_dir = config::resolve_data_dir(cli.data_dir.clone())?;
    let app = App::initialize(&data_dir)?;
    report_integrity(&app.integrity, cli.format)?;

    let result = dispatch(&app, cli.command, cli.format);
    if let Err(err) = app.shutdown() {
        error!("{err:#}");
    }
    result
}

fn dispatch(app: &App, command: Command, format: OutputFormat) -> Result<()> {
    match command {
        Command::Import { archives } => import_archives(app, &archives, format),
        Command::Add { dir_name } => {
            let preview = app.importer.import_directory(&dir_name)?;
            print_preview(&preview, format)
        }
        Command::Scan { import } => scan(app, import, format),
        Command::List { inactive } => {
            let courses = if inactive {
                app.courses.list_inactive()?
            } else {
                app.courses.list()?
            };
            print_courses(&courses, format)
        }
        Command::Show { course_id } => {
            let view = app.courses.show(&course_id)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
                OutputFormat::Text => {
                    let course = &view.course;
                    println!("{} ({})", course.name, course.id);
                    if !course.description.is_empty() {
                        println!("{}", course.description);
                    }
                    println!("Build: {}", course.build_at);
                    println!(
                        "Progress: {}/{} lessons ({}%)",
                        view.progress.completed, view.progress.total, view.progress.percent
                    );
                    for chapter in &course.chapters {
                        println!("  {}", chapter.name);
                        for lesson in &chapter.lessons {
                            let done = if view.completed_lessons.contains(&lesson.id) {
                                "x"
                            } else {
                                " "
                            };
                            println!("    [{done}] {} ({})", lesson.name, lesson.id);
                        }
                    }
                }
            }
            Ok(())
        }
        Command::Recent { limit } => {
            let recent = app
                .courses
                .recent(limit.unwrap_or(app.config.recent_limit))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&recent)?),
                OutputFormat::Text => {
                    if recent.is_empty() {
                        println!("No recently opened courses.");
                    }
                    for item in recent {
                        println!(
                            "{} {:>3}% {} ({})",
                            format_timestamp(item.accessed_at),
                            item.progress.percent,
                            item.course.name,
                            item.course.id
                        );
                    }
                }
            }
            Ok(())
        }
        Command::Deactivate { course_id } => {
            app.courses.deactivate(&course_id)?;
            print_message(&format!("Course {course_id} deactivated"), format)
        }
        Command::Delete { course_id } => {
            app.courses.hard_delete(&course_id)?;
            print_message(&format!("Course {course_id} deleted"), format)
        }
        Command::Mark {
            course_id,
            lesson_id,
            undo,
        } => {
            let progress = app.courses.mark_lesson(&course_id, &lesson_id, !undo)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&progress)?),
                OutputFormat::Text => println!(
                    "{course_id}: {}/{} lessons ({}%)",
                    progress.completed, progress.total, progress.percent
                ),
            }
            Ok(())
        }
        Command::Root { action } => root(app, action, format),
    }
}

fn import_archives(app: &App, archives: &[PathBuf], format: OutputFormat) -> Result<()> {
    let mut imported = Vec::new();
    let mut failures = 0usize;
    for archive in archives {
        let result = match format {
            OutputFormat::Text => {
                let sink = BarSink::new(archive.display().to_string());
                let result = app.importer.import_archive(archive, &sink);
                sink.finish();
                result
            }
            OutputFormat::Json => app.importer.import_archive(archive, &SilentSink),
        };
        match result {
            Ok(preview) => {
                if format == OutputFormat::Text {
                    println!("Imported {} ({})", preview.name, preview.id);
                }
                imported.push(preview);
            }
            Err(err) => {
                failures += 1;
                eprintln!("{}: {err}", archive.display());
            }
        }
    }
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&imported)?);
    }
    if failures > 0 {
        bail!("{failures} of {} archive(s) failed to import", archives.len());
    }
    Ok(())
}

fn scan(app: &App, import: bool, format: OutputFormat) -> Result<()> {
    let found = folder::scan_for_courses(app.store())?;
    let scanned = folder::classify_scanned(app.store(), found)?;

    if import {
        let mut added = Vec::new();
        for course in &scanned {
            let Some(dir_name) = course.directory.file_name() else {
                continue;
            };
            match app.importer.import_directory(&dir_name.to_string_lossy()) {
                Ok(preview) => added.push(preview),
                Err(err) => eprintln!("{}: {err}", course.directory.display()),
            }
        }
        return match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&added)?);
                Ok(())
            }
            OutputFormat::Text => {
                for preview in &added {
                    println!("Added {} ({})", preview.name, preview.id);
                }
                println!("{} of {} course(s) added", added.len(), scanned.len());
                Ok(())
            }
        };
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&scanned)?),
        OutputFormat::Text => {
            if scanned.is_empty() {
                println!("No new courses or updates detected");
            } else {
                println!("{} new courses or updates detected", scanned.len());
            }
            for course in &scanned {
                let kind = match course.kind {
                    folder::ScanKind::Import => "new",
                    folder::ScanKind::Update => "update",
                };
                println!(
                    "{kind:<6} {} ({}) {}",
                    course.metadata.name,
                    course.metadata.id,
                    course.directory.display()
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct RootOutput {
    path: Option<PathBuf>,
}

fn root(app: &App, action: RootAction, format: OutputFormat) -> Result<()> {
    let path = match action {
        RootAction::Show => app.store().root_path()?,
        RootAction::Set { path } => Some(folder::set_root(app.store(), &path)?),
        RootAction::Clear => {
            folder::clear_root(app.store())?;
            None
        }
    };
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&RootOutput { path })?);
        }
        OutputFormat::Text => match path {
            Some(path) => println!("{}", path.display()),
            None => println!("No root folder set."),
        },
    }
    Ok(())
}

fn report_integrity(result: &IntegrityCheckResult, format: OutputFormat) -> Result<()> {
    if !result.changed_anything() {
        return Ok(());
    }
    match format {
        OutputFormat::Json => eprintln!("{}", serde_json::to_string(result)?),
        OutputFormat::Text => {
            if result.root_path_removed {
                eprintln!(
                    "Root folder is missing; it was unset and {} course(s) were deactivated.",
                    result.deactivated
                );
            } else {
                eprintln!(
                    "{} of {} course(s) deactivated because their folder is missing: {}",
                    result.deactivated,
                    result.total_checked,
                    result.deactivated_course_ids.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn print_preview(preview: &CoursePreview, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(preview)?),
        OutputFormat::Text => println!(
            "Added {} ({}) from {}",
            preview.name, preview.id, preview.folder_name
        ),
    }
    Ok(())
}

fn print_courses(courses: &[CourseRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(courses)?),
        OutputFormat::Text => {
            if courses.is_empty() {
                println!("No courses.");
            }
            for course in courses {
                println!(
                    "{id:<24} {lessons:>4} lessons  {build:<25} {name}",
                    id = course.id,
                    lessons = course.lesson_count(),
                    build = course.build_at,
                    name = course.name
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    message: &'a str,
}

fn print_message(message: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&MessageOutput { message })?)
        }
        OutputFormat::Text => println!("{message}"),
    }
    Ok(())
}

fn format_timestamp(timestamp: i64) -> String {
    let format = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]");
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .and_then(|date| date.format(&format).ok())
        .unwrap_or_else(|| "----------------".to_string())
}

/// Terminal progress bar fed by import events.
struct BarSink {
    label: String,
    bar: Mutex<Option<ProgressBar>>,
}

impl BarSink {
    fn new(label: String) -> Self {
        Self {
            label,
            bar: Mutex::new(None),
        }
    }

    fn start(&self) {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template("  {msg} [{bar:30.cyan/dim}] {pos:>3}%")
            .map(|style| style.progress_chars("━╸─"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(self.label.clone());
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(old) = slot.replace(bar) {
                old.finish_and_clear();
            }
        }
    }

    fn finish(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}

impl ProgressSink for BarSink {
    fn report(&self, event: ImportEvent) {
        match event {
            ImportEvent::ExtractionStarted => self.start(),
            ImportEvent::ExtractionProgress(percent) => {
                if let Ok(slot) = self.bar.lock() {
                    if let Some(bar) = slot.as_ref() {
                        bar.set_position(u64::from(percent));
                    }
                }
            }
        }
    }
}

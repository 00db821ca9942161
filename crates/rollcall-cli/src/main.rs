use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceRecord, LateComer, Person, RecordStats};
use serde::Deserialize;
use std::path::PathBuf;

mod export;

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn start(&self) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn recent(&self) -> zbus::Result<String>;
    async fn register(&self, name: &str, class: &str) -> zbus::Result<String>;
    async fn register_descriptor(
        &self,
        name: &str,
        class: &str,
        descriptor: &str,
    ) -> zbus::Result<String>;
    async fn reenroll(&self, person_id: &str) -> zbus::Result<()>;
    async fn list_people(&self) -> zbus::Result<String>;
    async fn remove_person(&self, person_id: &str) -> zbus::Result<bool>;
    async fn list_records(&self, search: &str, date: &str) -> zbus::Result<String>;
    async fn late_comers(&self) -> zbus::Result<String>;
    async fn stats(&self) -> zbus::Result<String>;
    async fn export_records(
        &self,
        password: &str,
        search: &str,
        date: &str,
    ) -> zbus::Result<String>;
    async fn clear_records(&self, password: &str) -> zbus::Result<u64>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true, env = "ROLLCALL_SESSION_BUS")]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camera and begin taking attendance
    Start,
    /// Stop the camera
    Stop,
    /// Show daemon status
    Status,
    /// Show arrivals recorded since the daemon started
    Recent,
    /// Register a new person
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        class: String,
        /// Use a descriptor (JSON array) from a file instead of the camera
        #[arg(long)]
        descriptor_file: Option<PathBuf>,
    },
    /// Capture a fresh face for a registered person
    Reenroll {
        /// Person ID
        id: String,
    },
    /// List registered people
    People,
    /// Remove a registered person (attendance history is kept)
    Remove {
        /// Person ID
        id: String,
    },
    /// List attendance records, newest first
    Records {
        /// Match name or class (case-insensitive)
        #[arg(short, long, default_value = "")]
        search: String,
        /// Only this day (YYYY-MM-DD)
        #[arg(short, long, default_value = "")]
        date: String,
    },
    /// Show the late-comers roster
    LateComers,
    /// Show attendance summary figures
    Stats,
    /// Export records to an .xlsx workbook, one sheet per class
    Export {
        #[arg(short, long, default_value = "")]
        search: String,
        #[arg(short, long, default_value = "")]
        date: String,
        /// Output file (default: attendance_records_<today>.xlsx)
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[arg(long, env = "ROLLCALL_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Delete all attendance records
    Clear {
        #[arg(long, env = "ROLLCALL_PASSWORD", hide_env_values = true)]
        password: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// List video capture devices (does not need the daemon)
    Devices,
}

#[derive(Deserialize)]
struct RecentEntry {
    name: String,
    class: String,
    confidence: f32,
    is_late: bool,
    late_count: u32,
    at: DateTime<Local>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        list_devices();
        return Ok(());
    }

    let conn = if cli.session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Start => {
            proxy.start().await?;
            println!("Camera started");
        }
        Commands::Stop => {
            if proxy.stop().await? {
                println!("Camera stopped");
            } else {
                println!("Camera was not running");
            }
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Recent => {
            let entries: Vec<RecentEntry> = serde_json::from_str(&proxy.recent().await?)?;
            if entries.is_empty() {
                println!("No attendance recorded yet");
            }
            for e in entries {
                println!(
                    "{}  {:<24} {:<10} {:>5.1}%  {}",
                    e.at.format("%H:%M:%S"),
                    e.name,
                    e.class,
                    e.confidence * 100.0,
                    late_cell(e.is_late, e.late_count),
                );
            }
        }
        Commands::Register {
            name,
            class,
            descriptor_file,
        } => {
            let json = match descriptor_file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    proxy.register_descriptor(&name, &class, &text).await?
                }
                None => {
                    println!("Look at the camera...");
                    proxy.register(&name, &class).await?
                }
            };
            let person: Person = serde_json::from_str(&json)?;
            println!("Registered {} ({}) as {}", person.name, person.class, person.id);
        }
        Commands::Reenroll { id } => {
            println!("Look at the camera...");
            proxy.reenroll(&id).await?;
            println!("Face updated for {id}");
        }
        Commands::People => {
            let people: Vec<Person> = serde_json::from_str(&proxy.list_people().await?)?;
            if people.is_empty() {
                println!("No one registered");
            }
            for p in people {
                println!(
                    "{}  {:<24} {:<10} registered {}",
                    p.id,
                    p.name,
                    p.class,
                    p.registered_at.format("%Y-%m-%d")
                );
            }
        }
        Commands::Remove { id } => {
            if proxy.remove_person(&id).await? {
                println!("Removed {id}");
            } else {
                bail!("no person with id {id}");
            }
        }
        Commands::Records { search, date } => {
            let records: Vec<AttendanceRecord> =
                serde_json::from_str(&proxy.list_records(&search, &date).await?)?;
            print_records(&records);
        }
        Commands::LateComers => {
            let roster: Vec<LateComer> = serde_json::from_str(&proxy.late_comers().await?)?;
            if roster.is_empty() {
                println!("No late comers");
            }
            for l in roster {
                println!("{:<24} {:<10} {:>4}", l.name, l.class, l.total_late_count);
            }
        }
        Commands::Stats => {
            let stats: RecordStats = serde_json::from_str(&proxy.stats().await?)?;
            println!("Total records:    {}", stats.total_records);
            println!("Today:            {}", stats.today_records);
            println!("Unique people:    {}", stats.unique_people);
            println!("Average per day:  {}", stats.average_per_day);
        }
        Commands::Export {
            search,
            date,
            out,
            password,
        } => {
            let json = proxy.export_records(&password, &search, &date).await?;
            let records: Vec<AttendanceRecord> = serde_json::from_str(&json)?;
            let path = out.unwrap_or_else(|| export::default_file_name(Local::now().date_naive()));
            export::write_xlsx(&records, &path)?;
            println!("Exported {} records to {}", records.len(), path.display());
        }
        Commands::Clear { password, yes } => {
            if !yes {
                bail!("this deletes every attendance record; pass --yes to confirm");
            }
            let removed = proxy.clear_records(&password).await?;
            println!("Deleted {removed} records");
        }
        Commands::Devices => {}
    }

    Ok(())
}

fn late_cell(is_late: bool, late_count: u32) -> String {
    if is_late {
        format!("Late ({late_count})")
    } else {
        "On Time".to_string()
    }
}

fn print_records(records: &[AttendanceRecord]) {
    if records.is_empty() {
        println!("No records found");
        return;
    }
    println!(
        "{:<19}  {:<24} {:<10} {:>6}  {:<10} {:>6}",
        "Time", "Name", "Class", "Conf", "Status", "Absent"
    );
    for r in records {
        println!(
            "{:<19}  {:<24} {:<10} {:>5.1}%  {:<10} {:>6}",
            r.created_at.format("%Y-%m-%d %H:%M:%S"),
            r.person_name,
            r.person_class,
            r.confidence * 100.0,
            late_cell(r.is_late, r.late_count),
            r.absent_count,
        );
    }
}

fn list_devices() {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No video capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

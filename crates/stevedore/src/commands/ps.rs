//! Contains functionality of the ps command
use std::fmt::Write as _;
use std::io;
use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Local};
use clap::Parser;
use libstevedore::labels::InternalLabels;
use libstevedore::runtime::{ContainerRecord, Runtime, TaskStatus};
use libstevedore::utils::short_id;
use tabwriter::TabWriter;

use super::CommandContext;

/// List containers
#[derive(Parser, Debug)]
pub struct Ps {
    /// Show all containers, not only running ones
    #[clap(short, long)]
    pub all: bool,
    /// Only display container IDs
    #[clap(short, long)]
    pub quiet: bool,
    /// Don't truncate output
    #[clap(long)]
    pub no_trunc: bool,
}

struct Row {
    id: String,
    image: String,
    created: String,
    status: TaskStatus,
    name: String,
}

fn rows(runtime: &dyn Runtime, all: bool, no_trunc: bool) -> Result<Vec<Row>> {
    let mut containers: Vec<ContainerRecord> = runtime.containers()?;
    containers.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut rows = Vec::new();
    for container in containers {
        let status = runtime
            .task(&container.id)?
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Created);
        if !all && !status.is_running() {
            continue;
        }
        let name = match InternalLabels::from_labels(&container.labels) {
            Ok(internal) => internal.name,
            Err(err) => {
                tracing::warn!(id = %container.id, %err, "failed to read container labels");
                String::new()
            }
        };
        let local: DateTime<Local> = DateTime::from(container.created_at);
        rows.push(Row {
            id: if no_trunc {
                container.id.clone()
            } else {
                short_id(&container.id).to_owned()
            },
            image: container.image.clone().unwrap_or_default(),
            created: local.to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
            status,
            name,
        });
    }
    Ok(rows)
}

fn render(rows: &[Row]) -> Result<String> {
    let mut content = String::new();
    for row in rows {
        let _ = writeln!(
            content,
            "{}\t{}\t{}\t{}\t{}",
            row.id, row.image, row.created, row.status, row.name
        );
    }

    let mut table = Vec::new();
    let mut tab_writer = TabWriter::new(&mut table);
    writeln!(&mut tab_writer, "ID\tIMAGE\tCREATED\tSTATUS\tNAMES")?;
    write!(&mut tab_writer, "{content}")?;
    tab_writer.flush()?;
    drop(tab_writer);
    Ok(String::from_utf8(table)?)
}

/// lists the containers of the namespace
pub fn ps(args: Ps, ctx: &CommandContext) -> Result<()> {
    let rows = rows(&ctx.runtime, args.all, args.no_trunc)?;
    let mut stdout = io::stdout().lock();
    if args.quiet {
        for row in &rows {
            writeln!(stdout, "{}", row.id)?;
        }
        return Ok(());
    }
    write!(stdout, "{}", render(&rows)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libstevedore::runtime::TaskInfo;
    use libstevedore::test_utils::FakeRuntime;

    #[test]
    fn test_rows_filter_running() -> Result<()> {
        let runtime = FakeRuntime::default()
            .with_container(&"a".repeat(64), "web")
            .with_container(&"b".repeat(64), "");
        runtime.set_task(
            &"a".repeat(64),
            TaskInfo {
                pid: 10,
                status: TaskStatus::Running,
            },
        );

        let running = rows(&runtime, false, false)?;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a".repeat(12));
        assert_eq!(running[0].name, "web");

        let all = rows(&runtime, true, true)?;
        assert_eq!(all.len(), 2);
        let created = "b".repeat(64);
        assert!(all
            .iter()
            .any(|r| r.id == created && r.status == TaskStatus::Created));
        Ok(())
    }

    #[test]
    fn test_render_aligns_columns() -> Result<()> {
        let table = render(&[Row {
            id: "abc".to_owned(),
            image: "docker.io/library/alpine:latest".to_owned(),
            created: "2024-01-01T00:00:00+00:00".to_owned(),
            status: TaskStatus::Running,
            name: "web".to_owned(),
        }])?;
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ID "));
        let column = lines[0].find("IMAGE").unwrap();
        assert_eq!(lines[1].find("docker.io").unwrap(), column);
        assert!(lines[1].ends_with("web"));
        Ok(())
    }
}

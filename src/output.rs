use std::io::{self, Write};

use serde::Serialize;

use crate::accounting::{AccountTotals, ResyncReport};
use crate::app::{DeleteResult, StorageUsage, StoreStats, SweepResult};
use crate::domain::{DemoPointer, Project};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_project(project: &Project) -> io::Result<()> {
        Self::print_json(project)
    }

    pub fn print_projects(projects: &[Project]) -> io::Result<()> {
        Self::print_json(projects)
    }

    pub fn print_delete(result: &DeleteResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_demo(pointer: &DemoPointer) -> io::Result<()> {
        Self::print_json(pointer)
    }

    pub fn print_resync(report: &ResyncReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_totals(totals: &AccountTotals) -> io::Result<()> {
        Self::print_json(totals)
    }

    pub fn print_usage(usage: &StorageUsage) -> io::Result<()> {
        Self::print_json(usage)
    }

    pub fn print_stats(stats: &StoreStats) -> io::Result<()> {
        Self::print_json(stats)
    }

    pub fn print_sweep(result: &SweepResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

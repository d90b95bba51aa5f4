use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use time::{OffsetDateTime, format_description};

use crate::coordination::{Agent, EpisodeReport, PotentialCollisionData};
use crate::env::{Pomdp, StateId};
use crate::infra::{CoordinationObserver, ResolutionOutcome};

const COLLIDE: &str = "collide";

/// Writes one text file per episode: a line per agent step and a `collide`
/// line per co-occupancy.
pub struct TrackFile {
    folder: PathBuf,
    path: Option<PathBuf>,
    file: Option<File>,
}

impl TrackFile {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            path: None,
            file: None,
        }
    }

    /// Path of the track being written, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn open_episode(&mut self, episode: usize) -> io::Result<PathBuf> {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let format = format_description::parse("[year][month][day]-[hour][minute][second]").map_err(io::Error::other)?;
        let date_time_str = now.format(&format).map_err(io::Error::other)?;

        let filename = self
            .folder
            .join(format!("{} - episode-{}.track", date_time_str, episode));

        if let Some(parent) = filename.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        self.file = Some(File::create(&filename)?);
        self.path = Some(filename.clone());
        Ok(filename)
    }

    pub fn append(&mut self, line: &str) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{}", line)?;
            file.flush()?;
        }
        Ok(())
    }

    fn record(&mut self, line: &str) {
        if let Err(e) = self.append(line) {
            tracing::warn!("Track: write failed ({}), closing {:?}", e, self.path);
            self.file = None;
        }
    }
}

/// Number of `collide` lines in a track.
pub fn count_collisions(path: &Path) -> io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    for line in reader.lines() {
        if line?.starts_with(COLLIDE) {
            count += 1;
        }
    }
    Ok(count)
}

impl CoordinationObserver for TrackFile {
    fn on_episode_start(&mut self, episode: usize, agents: &[Agent]) {
        if let Err(e) = self.open_episode(episode) {
            tracing::warn!("Track: cannot create track in {:?}: {}", self.folder, e);
            return;
        }
        self.record(&format!("episode {}", episode));
        for agent in agents {
            let model = agent.model();
            self.record(&format!(
                "agent {} start {} goal {}",
                agent.label(),
                model.state_label(agent.true_state()),
                model.goal_position()
            ));
        }
    }

    fn on_conflict(&mut self, round: usize, conflict: &PotentialCollisionData, agents: &[Agent]) {
        let labels: String = conflict.members().iter().map(|&i| agents[i].label()).collect();
        self.record(&format!("conflict {} {} step {}", round, labels, conflict.step()));
    }

    fn on_resolution(&mut self, round: usize, outcome: ResolutionOutcome) {
        if let ResolutionOutcome::Yielded { agent, timer, .. } = outcome {
            self.record(&format!("yield {} {} timer {}", round, agent, timer));
        }
    }

    fn on_agent_step(&mut self, round: usize, agent: &Agent) {
        let model = agent.model();
        let action = agent
            .last_action()
            .map_or("-".to_string(), |a| model.action_label(a));
        self.record(&format!(
            "{} {} {} {} {:?}",
            round,
            agent.label(),
            model.state_label(agent.true_state()),
            action,
            agent.status()
        ));
    }

    fn on_collision(&mut self, round: usize, first: &Agent, second: &Agent, state: StateId) {
        self.record(&format!(
            "{} {} {} {} {}",
            COLLIDE,
            round,
            first.label(),
            second.label(),
            first.model().state_label(state)
        ));
    }

    fn on_episode_finished(&mut self, report: &EpisodeReport) {
        self.record(&format!(
            "end rounds {} reward {:.3} collisions {}",
            report.rounds, report.total_reward, report.collisions
        ));
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_counts_collide_lines() {
        let folder = std::env::temp_dir().join(format!("gridcoord-track-{}", std::process::id()));
        let mut track = TrackFile::new(&folder);
        let path = track.open_episode(7).unwrap();
        assert!(path.to_string_lossy().ends_with(" - episode-7.track"));

        track.append("0 a <1,2> e Active").unwrap();
        track.append("collide 0 a b <2,2>").unwrap();
        track.append("1 a <2,2> e Active").unwrap();
        track.append("collide 1 a b <2,2>").unwrap();
        assert_eq!(track.path(), Some(path.as_path()));
        assert_eq!(count_collisions(&path).unwrap(), 2);

        let _ = std::fs::remove_dir_all(&folder);
    }

    #[test]
    fn test_track_without_episode_is_silent() {
        let mut track = TrackFile::new("unused");
        assert!(track.append("collide 0 a b").is_ok());
        assert!(track.path().is_none());
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::env::{Beacon, BeaconGrid, GridParams};
use crate::infra::{ModelError, Position};
use crate::state::GridMap;

/// Start cells and goal of one agent in a scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: char,
    pub starts: Vec<Position>,
    pub goal: Position,
}

/// Layout, beacons and agents of a multi-agent run.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub map: Arc<GridMap>,
    pub beacons: Vec<Beacon>,
    pub agents: Vec<AgentSpec>,
}

impl Scenario {
    /// Parse an ASCII layout.
    ///
    /// `#` is a hole, `.` or space a free cell, a digit a beacon with that
    /// range. A lowercase letter marks a start cell of the agent with that
    /// name (several cells mean an uncertain start) and the matching
    /// uppercase letter its goal. Short lines are padded with holes.
    pub fn from_ascii(text: &str) -> Result<Self, ModelError> {
        let lines: Vec<&str> = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect();
        if lines.is_empty() {
            return Err(ModelError::InvalidScenario("empty layout".to_string()));
        }

        let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) as i32;
        let height = lines.len() as i32;

        let mut holes = Vec::new();
        let mut beacons = Vec::new();
        let mut starts: BTreeMap<char, Vec<Position>> = BTreeMap::new();
        let mut goals: BTreeMap<char, Position> = BTreeMap::new();

        for (y, line) in lines.iter().enumerate() {
            let chars: Vec<char> = line.chars().collect();
            for x in 0..width {
                let pos = Position::new(x, y as i32);
                match chars.get(x as usize).copied().unwrap_or('#') {
                    '#' => holes.push(pos),
                    '.' | ' ' => {}
                    c if c.is_ascii_digit() => {
                        let range = c.to_digit(10).unwrap_or(0) as i32;
                        beacons.push(Beacon::new(pos, range));
                    }
                    c if c.is_ascii_lowercase() => starts.entry(c).or_default().push(pos),
                    c if c.is_ascii_uppercase() => {
                        let name = c.to_ascii_lowercase();
                        if goals.insert(name, pos).is_some() {
                            return Err(ModelError::InvalidScenario(format!(
                                "agent '{}' has more than one goal",
                                name
                            )));
                        }
                    }
                    c => {
                        return Err(ModelError::InvalidScenario(format!(
                            "unexpected character '{}' at {}",
                            c, pos
                        )));
                    }
                }
            }
        }

        for name in goals.keys() {
            if !starts.contains_key(name) {
                return Err(ModelError::MissingStart(*name));
            }
        }

        let mut agents = Vec::new();
        for (name, cells) in starts {
            let goal = goals.get(&name).copied().ok_or(ModelError::MissingGoal(name))?;
            agents.push(AgentSpec {
                name,
                starts: cells,
                goal,
            });
        }
        if agents.is_empty() {
            return Err(ModelError::InvalidScenario("no agents".to_string()));
        }

        Ok(Self {
            map: Arc::new(GridMap::new(width, height, holes)),
            beacons,
            agents,
        })
    }

    /// Two agents on an open 5x5 grid whose shortest paths cross in the
    /// centre at the same time step.
    pub fn crossing() -> Result<Self, ModelError> {
        let layout = "\
..b..
.....
a...A
.....
..B..
";
        Self::from_ascii(layout)
    }

    /// One model per agent, sharing map and beacons.
    pub fn build_models(&self, params: &GridParams) -> Result<Vec<Arc<BeaconGrid>>, ModelError> {
        self.agents
            .iter()
            .map(|agent| {
                BeaconGrid::with_start_cells(
                    self.map.clone(),
                    self.beacons.clone(),
                    &agent.starts,
                    agent.goal,
                    params.clone(),
                )
                .map(Arc::new)
            })
            .collect()
    }

    pub fn draw(&self) -> String {
        let mut marks = Vec::new();
        for beacon in &self.beacons {
            let digit = char::from_digit(beacon.range.clamp(0, 9) as u32, 10).unwrap_or('?');
            marks.push((beacon.position, digit));
        }
        for agent in &self.agents {
            marks.push((agent.goal, agent.name.to_ascii_uppercase()));
            for start in &agent.starts {
                marks.push((*start, agent.name));
            }
        }
        self.map.draw_ascii(&marks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_crossing() {
        let scenario = Scenario::crossing().unwrap();
        assert_eq!(scenario.map.len(), 25);
        assert_eq!(scenario.agents.len(), 2);
        assert_eq!(scenario.agents[0].starts, vec![Position::new(0, 2)]);
        assert_eq!(scenario.agents[0].goal, Position::new(4, 2));
        assert_eq!(scenario.agents[1].starts, vec![Position::new(2, 0)]);
        assert_eq!(scenario.agents[1].goal, Position::new(2, 4));
    }

    #[test]
    fn test_scenario_parse_holes_beacons_and_uncertain_start() {
        let scenario = Scenario::from_ascii("a#3\na.A\n##").unwrap();
        assert_eq!(scenario.map.width, 3);
        assert_eq!(scenario.map.height, 3);
        // two explicit holes plus the padded third cell of the last line
        assert_eq!(scenario.map.len(), 9 - 4);
        assert_eq!(scenario.beacons, vec![Beacon::new(Position::new(2, 0), 3)]);
        assert_eq!(scenario.agents[0].starts.len(), 2);

        let models = scenario.build_models(&GridParams::default()).unwrap();
        assert_eq!(models.len(), 1);
    }

    #[test]
    fn test_scenario_errors() {
        assert!(matches!(
            Scenario::from_ascii("a...\n"),
            Err(ModelError::MissingGoal('a'))
        ));
        assert!(matches!(
            Scenario::from_ascii("...B\n"),
            Err(ModelError::MissingStart('b'))
        ));
        assert!(Scenario::from_ascii("a.A?\n").is_err());
        assert!(Scenario::from_ascii("\n\n").is_err());
    }

    #[test]
    fn test_scenario_draw_round_trip() {
        let scenario = Scenario::crossing().unwrap();
        let drawn = scenario.draw();
        let reparsed = Scenario::from_ascii(&drawn).unwrap();
        assert_eq!(reparsed.agents, scenario.agents);
    }
}

use std::sync::Arc;

use inject_runtime::{Command, Direction, Vec3I};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("chain needs more room: placed {placed} of {required} commands along {available} positions")]
    CapacityExceeded {
        placed: usize,
        required: usize,
        available: usize,
    },
    #[error("curve position {index} is not a face neighbour of the next one")]
    BrokenCurve { index: usize },
}

/// A command block position produced by [`ChainPlacer`]. `command` is `None`
/// for a padding block that runs nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedCommand {
    pub command: Option<Arc<Command>>,
    pub coordinate: Vec3I,
    pub facing: Direction,
}

impl PlacedCommand {
    pub fn is_noop(&self) -> bool {
        self.command.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    command: usize,
    point: usize,
    placed: usize,
}

/// Lays commands along a face-connected curve, one block per position.
///
/// A conditional block only observes the block directly behind it, so it may
/// only sit where the chain runs straight through. When that fails the
/// placer rewinds to the last non-conditional command, pads with a no-op and
/// tries again one position further along.
#[derive(Debug, Clone)]
pub struct ChainPlacer {
    curve: Vec<Vec3I>,
    facings: Vec<Direction>,
    straight: Vec<bool>,
}

impl ChainPlacer {
    pub fn new(curve: Vec<Vec3I>) -> Result<Self, PlacementError> {
        let mut steps = Vec::with_capacity(curve.len().saturating_sub(1));
        for (index, pair) in curve.windows(2).enumerate() {
            let step =
                Direction::between(pair[0], pair[1]).ok_or(PlacementError::BrokenCurve { index })?;
            steps.push(step);
        }

        let facings: Vec<Direction> = (0..curve.len())
            .map(|index| {
                steps
                    .get(index)
                    .or_else(|| index.checked_sub(1).and_then(|prev| steps.get(prev)))
                    .copied()
                    .unwrap_or(Direction::East)
            })
            .collect();
        let straight = (0..curve.len())
            .map(|index| index > 0 && steps[index - 1] == facings[index])
            .collect();

        Ok(Self {
            curve,
            facings,
            straight,
        })
    }

    pub fn curve(&self) -> &[Vec3I] {
        &self.curve
    }

    pub fn capacity(&self) -> usize {
        self.curve.len()
    }

    pub fn place(&self, commands: &[Arc<Command>]) -> Result<Vec<PlacedCommand>, PlacementError> {
        let mut output: Vec<PlacedCommand> = Vec::with_capacity(commands.len());
        let mut checkpoint = Checkpoint {
            command: 0,
            point: 0,
            placed: 0,
        };
        let mut next_command = 0;
        let mut point = 0;

        while next_command < commands.len() {
            if point >= self.curve.len() {
                return Err(PlacementError::CapacityExceeded {
                    placed: next_command,
                    required: commands.len(),
                    available: self.curve.len(),
                });
            }

            let command = &commands[next_command];
            if !command.is_conditional() {
                checkpoint = Checkpoint {
                    command: next_command,
                    point,
                    placed: output.len(),
                };
            } else if !self.straight[point] {
                output.truncate(checkpoint.placed);
                next_command = checkpoint.command;
                point = checkpoint.point;
                output.push(self.at(point, None));
                point += 1;
                checkpoint = Checkpoint {
                    command: next_command,
                    point,
                    placed: output.len(),
                };
                continue;
            }

            output.push(self.at(point, Some(Arc::clone(command))));
            next_command += 1;
            point += 1;
        }

        Ok(output)
    }

    fn at(&self, point: usize, command: Option<Arc<Command>>) -> PlacedCommand {
        PlacedCommand {
            command,
            coordinate: self.curve[point],
            facing: self.facings[point],
        }
    }
}

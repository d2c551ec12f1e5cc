use crate::background::Background;

use super::runner::Runner;
use super::Next;

/// The runners of a schedule, executed in order once per iteration.
#[derive(Debug, Default)]
pub struct Assembler {
    runners: Vec<Runner>,
}

impl Assembler {
    pub fn new(runners: Vec<Runner>) -> Self {
        Self { runners }
    }

    pub fn runners(&self) -> &[Runner] {
        &self.runners
    }

    /// The first decision other than `Continue` ends the iteration.
    pub async fn run(&self, bg: &mut Background) -> Next {
        for runner in &self.runners {
            let decision = runner.run(bg).await;
            if decision != Next::Continue {
                return decision;
            }
        }
        Next::Continue
    }

    pub fn close(&self) {
        for runner in &self.runners {
            runner.close();
        }
    }
}

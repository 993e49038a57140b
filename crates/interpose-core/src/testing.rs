//! In-memory privileged shell for tests.
//!
//! [`FakeIptables`] interprets the `iptables -t nat` subset the rule controller
//! issues (`-S`, `-N`, `-F`, `-X`, `-A`, `-D`) against an in-memory nat table.
//! A batch stops at its first failing command and earlier commands stay
//! applied, like a `set -e` session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::CommandError;
use crate::rules::{NatTable, RULE_CHAIN};
use crate::shell::{PrivilegedShell, ShellOutput};
use crate::state::Target;

const DENIED_STDERR: &str = "su: permission denied";

#[derive(Debug, Default)]
struct FakeState {
    output: Vec<String>,
    chains: BTreeMap<String, Vec<String>>,
    deny: bool,
    fail_listing: bool,
    listings_left: Option<usize>,
    failing: Vec<String>,
    delay: Option<Duration>,
    active: usize,
    max_concurrent: usize,
    sessions: Vec<Vec<String>>,
}

impl FakeState {
    fn listing(&self) -> String {
        let mut out = String::new();
        for policy in ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"] {
            out.push_str(&format!("-P {} ACCEPT\n", policy));
        }
        for chain in self.chains.keys() {
            out.push_str(&format!("-N {}\n", chain));
        }
        for spec in &self.output {
            out.push_str(&format!("-A OUTPUT {}\n", spec));
        }
        for (chain, rules) in &self.chains {
            for spec in rules {
                out.push_str(&format!("-A {} {}\n", chain, spec));
            }
        }
        out
    }

    fn rules_mut(&mut self, chain: &str) -> Option<&mut Vec<String>> {
        if chain == "OUTPUT" {
            Some(&mut self.output)
        } else {
            self.chains.get_mut(chain)
        }
    }

    fn execute_batch(&mut self, commands: &[String]) -> ShellOutput {
        let mut stdout = String::new();
        for command in commands {
            if self.failing.iter().any(|needle| command.contains(needle.as_str())) {
                return failure(1, stdout, format!("iptables: injected failure for `{}`", command));
            }
            match self.execute(command) {
                Ok(text) => stdout.push_str(&text),
                Err((status, stderr)) => return failure(status, stdout, stderr),
            }
        }
        ShellOutput {
            status: 0,
            stdout,
            stderr: String::new(),
        }
    }

    fn execute(&mut self, command: &str) -> Result<String, (i32, String)> {
        let args = command
            .strip_prefix("iptables -t nat ")
            .ok_or_else(|| (127, format!("sh: {}: not found", command)))?;
        let tokens: Vec<&str> = args.split_whitespace().collect();

        match tokens.as_slice() {
            ["-S"] => {
                if let Some(left) = self.listings_left.as_mut() {
                    match left.checked_sub(1) {
                        Some(rest) => *left = rest,
                        None => self.fail_listing = true,
                    }
                }
                if self.fail_listing {
                    Err((3, "iptables v1.8.7 (legacy): can't initialize iptables table `nat'".into()))
                } else {
                    Ok(self.listing())
                }
            }
            ["-N", chain] => {
                if self.chains.contains_key(*chain) {
                    return Err((1, "iptables: Chain already exists.".into()));
                }
                self.chains.insert(chain.to_string(), Vec::new());
                Ok(String::new())
            }
            ["-F", chain] => {
                let rules = self.rules_mut(chain).ok_or_else(no_chain)?;
                rules.clear();
                Ok(String::new())
            }
            ["-X", chain] => {
                let rules = self.chains.get(*chain).ok_or_else(no_chain)?;
                if !rules.is_empty() {
                    return Err((1, "iptables: Directory not empty.".into()));
                }
                let jump = format!("-j {}", chain);
                if self.output.iter().any(|spec| spec.ends_with(&jump)) {
                    return Err((1, "iptables: Too many links.".into()));
                }
                self.chains.remove(*chain);
                Ok(String::new())
            }
            ["-A", chain, spec @ ..] => {
                let spec = spec.join(" ");
                if let Some(jump) = spec.strip_prefix("-j ") {
                    if jump != "DNAT" && !self.chains.contains_key(jump) {
                        return Err((2, format!("iptables v1.8.7 (legacy): Couldn't load target `{}'", jump)));
                    }
                }
                self.rules_mut(chain).ok_or_else(no_chain)?.push(spec);
                Ok(String::new())
            }
            ["-D", chain, spec @ ..] => {
                let spec = spec.join(" ");
                let rules = self.rules_mut(chain).ok_or_else(no_chain)?;
                let index = rules.iter().position(|r| *r == spec).ok_or_else(|| {
                    (
                        1,
                        "iptables: Bad rule (does a matching rule exist in that chain?).".to_string(),
                    )
                })?;
                rules.remove(index);
                Ok(String::new())
            }
            _ => Err((2, format!("iptables: unsupported arguments `{}`", args))),
        }
    }
}

fn no_chain() -> (i32, String) {
    (1, "iptables: No chain/target/match by that name.".into())
}

fn failure(status: i32, stdout: String, stderr: String) -> ShellOutput {
    ShellOutput {
        status,
        stdout,
        stderr,
    }
}

/// Shared handle to an in-memory nat table. Clones see the same table.
#[derive(Debug, Clone, Default)]
pub struct FakeIptables {
    state: Arc<Mutex<FakeState>>,
}

impl FakeIptables {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every session fail as if privileged access were refused.
    pub fn deny(&self, deny: bool) {
        self.state.lock().deny = deny;
    }

    /// Fails any command containing `needle`.
    pub fn fail_commands_containing(&self, needle: &str) {
        self.state.lock().failing.push(needle.to_string());
    }

    /// Removes all injected command failures.
    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Makes `-S` listings fail.
    pub fn fail_listing(&self, fail: bool) {
        let mut state = self.state.lock();
        state.fail_listing = fail;
        state.listings_left = None;
    }

    /// Lets the next `count` listings succeed, then fails every later one
    /// until [`fail_listing(false)`](Self::fail_listing).
    pub fn fail_listings_after(&self, count: usize) {
        let mut state = self.state.lock();
        state.fail_listing = false;
        state.listings_left = Some(count);
    }

    /// Holds every session for `delay` before running it.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// Installs a complete redirect set directly, as if left by an earlier run.
    pub fn preinstall(&self, target: Target) {
        let mut state = self.state.lock();
        state.chains.insert(
            RULE_CHAIN.to_string(),
            [80, 443]
                .iter()
                .map(|port| {
                    format!(
                        "-p tcp -m tcp --dport {} -j DNAT --to-destination {}",
                        port, target
                    )
                })
                .collect(),
        );
        state.output.push(format!("-j {}", RULE_CHAIN));
    }

    /// Adds an `OUTPUT` rule that does not belong to the redirect chain.
    pub fn add_output_rule(&self, spec: &str) {
        self.state.lock().output.push(spec.to_string());
    }

    /// Rule specs currently in the redirect chain.
    pub fn installed_rules(&self) -> Vec<String> {
        self.state
            .lock()
            .chains
            .get(RULE_CHAIN)
            .cloned()
            .unwrap_or_default()
    }

    /// Rule specs currently in `OUTPUT`.
    pub fn output_rules(&self) -> Vec<String> {
        self.state.lock().output.clone()
    }

    /// `(dport, destination)` of every redirect currently installed.
    pub fn destinations(&self) -> Vec<(u16, Target)> {
        NatTable::parse(&self.state.lock().listing())
            .rules
            .into_iter()
            .map(|rule| (rule.dport, rule.destination))
            .collect()
    }

    /// Highest number of sessions that ever ran at the same time.
    pub fn max_concurrent_sessions(&self) -> usize {
        self.state.lock().max_concurrent
    }

    /// Every batch received, in order.
    pub fn sessions(&self) -> Vec<Vec<String>> {
        self.state.lock().sessions.clone()
    }

    /// Batches that contained at least one mutating command.
    pub fn mutation_sessions(&self) -> usize {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|batch| batch.iter().any(|c| !c.ends_with(" -S")))
            .count()
    }
}

impl PrivilegedShell for FakeIptables {
    fn run(&self, commands: &[String]) -> Result<ShellOutput, CommandError> {
        let delay = {
            let mut state = self.state.lock();
            state.active += 1;
            state.max_concurrent = state.max_concurrent.max(state.active);
            state.sessions.push(commands.to_vec());
            state.delay
        };

        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.state.lock();
        let output = if state.deny {
            failure(1, String::new(), DENIED_STDERR.into())
        } else {
            state.execute_batch(commands)
        };
        state.active -= 1;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fake: &FakeIptables, commands: &[&str]) -> ShellOutput {
        let commands: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        fake.run(&commands).unwrap()
    }

    #[test]
    fn test_batch_stops_at_first_failure() {
        let fake = FakeIptables::new();
        let output = run(
            &fake,
            &[
                "iptables -t nat -N INTERPOSE",
                "iptables -t nat -N INTERPOSE",
                "iptables -t nat -A OUTPUT -j INTERPOSE",
            ],
        );
        assert_eq!(output.status, 1);
        assert!(output.stderr.contains("Chain already exists"));
        assert!(fake.output_rules().is_empty());
        assert!(fake.state.lock().chains.contains_key(RULE_CHAIN));
    }

    #[test]
    fn test_delete_chain_requires_no_references() {
        let fake = FakeIptables::new();
        fake.preinstall(Target::default());

        let output = run(&fake, &["iptables -t nat -F INTERPOSE", "iptables -t nat -X INTERPOSE"]);
        assert!(output.stderr.contains("Too many links"));
    }

    #[test]
    fn test_denied_session() {
        let fake = FakeIptables::new();
        fake.deny(true);
        let output = run(&fake, &["iptables -t nat -S"]);
        assert_eq!(output.status, 1);
        assert_eq!(output.stderr, DENIED_STDERR);
    }
}

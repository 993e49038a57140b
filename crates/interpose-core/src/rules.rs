//! Redirect rule controller.
//!
//! The two redirect rules (TCP 80 and 443 to the target) live in a dedicated
//! nat chain, [`RULE_CHAIN`], which `OUTPUT` jumps to. Owning a chain means
//! [`RuleController::clear`] only ever touches rules this controller created.
//!
//! Every call is a fresh blocking session against the privileged shell; the
//! controller keeps no state of its own.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::CommandError;
use crate::shell::{PrivilegedShell, ShellOutput};
use crate::state::Target;

/// Name of the nat chain holding the redirect rules.
pub const RULE_CHAIN: &str = "INTERPOSE";

/// Destination ports redirected to the target (HTTP, HTTPS).
pub const REDIRECTED_PORTS: [u16; 2] = [80, 443];

const LIST_COMMAND: &str = "iptables -t nat -S";

fn nat(args: impl AsRef<str>) -> String {
    format!("iptables -t nat {}", args.as_ref())
}

/// One DNAT rule inside [`RULE_CHAIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectRule {
    /// Destination port matched.
    pub dport: u16,
    /// Where matching traffic is sent.
    pub destination: Target,
}

impl RedirectRule {
    /// Rule specification as accepted after `-A <chain>`.
    fn spec(&self) -> String {
        format!(
            "-p tcp -m tcp --dport {} -j DNAT --to-destination {}",
            self.dport, self.destination
        )
    }

    fn append_command(&self) -> String {
        nat(format!("-A {} {}", RULE_CHAIN, self.spec()))
    }

    /// Parses the tokens after `-A <chain>` of a listing line.
    fn parse(tokens: &[&str]) -> Option<Self> {
        let after = |flag: &str| {
            tokens
                .iter()
                .position(|t| *t == flag)
                .and_then(|i| tokens.get(i + 1))
                .copied()
        };

        if after("-j")? != "DNAT" {
            return None;
        }
        let dport = after("--dport")?.parse().ok()?;
        let (address, port) = after("--to-destination")?.split_once(':')?;
        let destination = Target::new(address.parse::<Ipv4Addr>().ok()?, port.parse().ok()?);

        Some(Self { dport, destination })
    }
}

/// Parsed view of the nat table, as far as redirection is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatTable {
    /// Whether [`RULE_CHAIN`] exists.
    pub chain_present: bool,
    /// Number of `OUTPUT` rules jumping to [`RULE_CHAIN`].
    pub jumps: usize,
    /// DNAT rules found in [`RULE_CHAIN`].
    pub rules: Vec<RedirectRule>,
    /// Rules in [`RULE_CHAIN`] that are not recognisable redirects.
    pub foreign: usize,
}

impl NatTable {
    /// Parses the output of `iptables -t nat -S`.
    pub fn parse(listing: &str) -> Self {
        let mut table = Self::default();

        for line in listing.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["-N", chain] if *chain == RULE_CHAIN => table.chain_present = true,
                ["-A", "OUTPUT", rest @ ..] => {
                    if rest.windows(2).any(|w| w[0] == "-j" && w[1] == RULE_CHAIN) {
                        table.jumps += 1;
                    }
                }
                ["-A", chain, rest @ ..] if *chain == RULE_CHAIN => match RedirectRule::parse(rest)
                {
                    Some(rule) => table.rules.push(rule),
                    None => table.foreign += 1,
                },
                _ => {}
            }
        }

        table
    }

    /// Whether any redirect rule is present.
    pub fn has_redirects(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Returns the target if the table holds exactly one HTTP and one HTTPS
    /// redirect to the same destination, reachable from `OUTPUT`.
    pub fn complete_target(&self) -> Option<Target> {
        if self.jumps == 0 || self.foreign > 0 || self.rules.len() != REDIRECTED_PORTS.len() {
            return None;
        }

        let destination = self.rules[0].destination;
        let ports: BTreeSet<u16> = self.rules.iter().map(|r| r.dport).collect();
        let expected: BTreeSet<u16> = REDIRECTED_PORTS.into_iter().collect();

        let same_destination = self.rules.iter().all(|r| r.destination == destination);
        (same_destination && ports == expected).then_some(destination)
    }
}

/// Installs, removes and probes the redirect rule pair.
#[derive(Clone)]
pub struct RuleController {
    shell: Arc<dyn PrivilegedShell>,
}

impl RuleController {
    /// Creates a controller issuing commands through `shell`.
    pub fn new(shell: Arc<dyn PrivilegedShell>) -> Self {
        Self { shell }
    }

    /// Installs both redirect rules towards `target`, replacing any existing
    /// set.
    ///
    /// After the batch runs the table is listed again. Anything other than the
    /// exact pair at `target` is rolled back to what was installed before and
    /// reported as [`CommandError::IncompleteRuleSet`].
    pub fn apply(&self, target: &Target) -> Result<(), CommandError> {
        let before = self.inspect()?;

        let mut commands = Vec::new();
        if before.chain_present {
            commands.push(nat(format!("-F {}", RULE_CHAIN)));
        } else {
            commands.push(nat(format!("-N {}", RULE_CHAIN)));
        }
        if before.jumps == 0 {
            commands.push(nat(format!("-A OUTPUT -j {}", RULE_CHAIN)));
        }
        commands.extend(REDIRECTED_PORTS.iter().map(|&dport| {
            RedirectRule {
                dport,
                destination: *target,
            }
            .append_command()
        }));

        if let Err(e) = self.execute(&commands) {
            warn!(%target, error = %e, "redirect apply failed, restoring previous rules");
            self.restore(&before);
            return Err(e);
        }

        let after = match self.inspect() {
            Ok(table) => table,
            Err(e) => {
                warn!(%target, error = %e, "could not verify applied rules, restoring previous rules");
                self.restore(&before);
                return Err(e);
            }
        };

        if after.complete_target() != Some(*target) {
            let found = after.rules.len();
            warn!(%target, found, "redirect rule set incomplete, restoring previous rules");
            self.restore(&before);
            return Err(CommandError::IncompleteRuleSet { found });
        }

        info!(%target, "redirect rules installed");
        Ok(())
    }

    /// Removes the redirect chain and its jump. Succeeds without running any
    /// mutation when nothing is installed.
    pub fn clear(&self) -> Result<(), CommandError> {
        let table = self.inspect()?;
        if !table.chain_present && table.jumps == 0 {
            debug!("no redirect rules to clear");
            return Ok(());
        }

        let mut commands: Vec<String> = (0..table.jumps)
            .map(|_| nat(format!("-D OUTPUT -j {}", RULE_CHAIN)))
            .collect();
        if table.chain_present {
            commands.push(nat(format!("-F {}", RULE_CHAIN)));
            commands.push(nat(format!("-X {}", RULE_CHAIN)));
        }

        self.execute(&commands)?;
        info!("redirect rules removed");
        Ok(())
    }

    /// Returns whether redirect rules are present. Inspection failures are
    /// logged and read as `false`.
    pub fn probe(&self) -> bool {
        match self.inspect() {
            Ok(table) => table.has_redirects(),
            Err(e) => {
                warn!(error = %e, "rule probe inconclusive, reporting inactive");
                false
            }
        }
    }

    /// Returns the target of a complete installed rule set. Inspection
    /// failures and partial sets read as `None`.
    pub fn probe_target(&self) -> Option<Target> {
        match self.inspect() {
            Ok(table) => {
                let target = table.complete_target();
                if target.is_none() && table.has_redirects() {
                    warn!(
                        rules = table.rules.len(),
                        "partial redirect rule set installed, reporting inactive"
                    );
                }
                target
            }
            Err(e) => {
                warn!(error = %e, "rule probe inconclusive, reporting inactive");
                None
            }
        }
    }

    /// Lists and parses the nat table.
    pub fn inspect(&self) -> Result<NatTable, CommandError> {
        let output = self.execute(&[LIST_COMMAND.to_string()])?;
        Ok(NatTable::parse(&output.stdout))
    }

    /// Puts back the complete set from `before`, or clears if there was none.
    fn restore(&self, before: &NatTable) {
        let result = match before.complete_target() {
            Some(previous) => {
                let mut commands = vec![nat(format!("-F {}", RULE_CHAIN))];
                commands.extend(REDIRECTED_PORTS.iter().map(|&dport| {
                    RedirectRule {
                        dport,
                        destination: previous,
                    }
                    .append_command()
                }));
                self.execute(&commands)
                    .and_then(|_| self.inspect())
                    .and_then(|table| {
                        if table.complete_target() == Some(previous) {
                            Ok(())
                        } else {
                            self.clear()
                        }
                    })
            }
            None => self.clear().or_else(|e| {
                warn!(error = %e, "cannot list rules for rollback, removing what apply added");
                self.teardown(before)
            }),
        };

        if let Err(e) = result {
            error!(error = %e, "failed to restore redirect rules");
        }
    }

    /// Undoes an apply batch without listing first. Only what was absent in
    /// `before` is deleted; a chain that already existed is flushed instead.
    fn teardown(&self, before: &NatTable) -> Result<(), CommandError> {
        let mut commands = Vec::new();
        if before.jumps == 0 {
            commands.push(nat(format!("-D OUTPUT -j {}", RULE_CHAIN)));
        }
        commands.push(nat(format!("-F {}", RULE_CHAIN)));
        if !before.chain_present {
            commands.push(nat(format!("-X {}", RULE_CHAIN)));
        }
        self.execute(&commands).map(|_| ())
    }

    fn execute(&self, commands: &[String]) -> Result<ShellOutput, CommandError> {
        let output = self.shell.run(commands)?;
        classify(output)
    }
}

impl std::fmt::Debug for RuleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleController").finish_non_exhaustive()
    }
}

/// Maps a finished session to success or a [`CommandError`].
fn classify(output: ShellOutput) -> Result<ShellOutput, CommandError> {
    if output.success() {
        return Ok(output);
    }

    let stderr = output.stderr.trim().to_string();
    let lowered = stderr.to_lowercase();
    let denied = [
        "permission denied",
        "not allowed",
        "a password is required",
        "you must be root",
    ]
    .iter()
    .any(|marker| lowered.contains(marker));

    if denied {
        Err(CommandError::PermissionDenied(stderr))
    } else {
        Err(CommandError::CommandFailed {
            exit_code: output.status,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeIptables;

    fn controller(fake: &FakeIptables) -> RuleController {
        RuleController::new(Arc::new(fake.clone()))
    }

    fn target(address: &str, port: u16) -> Target {
        Target::parse(address, port).unwrap()
    }

    #[test]
    fn test_parse_listing() {
        let listing = "\
-P PREROUTING ACCEPT
-P OUTPUT ACCEPT
-N INTERPOSE
-N DOCKER
-A OUTPUT -j INTERPOSE
-A OUTPUT ! -d 127.0.0.0/8 -m addrtype --dst-type LOCAL -j DOCKER
-A INTERPOSE -p tcp -m tcp --dport 80 -j DNAT --to-destination 10.0.0.5:8081
-A INTERPOSE -p tcp -m tcp --dport 443 -j DNAT --to-destination 10.0.0.5:8081
";
        let table = NatTable::parse(listing);
        assert!(table.chain_present);
        assert_eq!(table.jumps, 1);
        assert_eq!(table.rules.len(), 2);
        assert_eq!(table.foreign, 0);
        assert_eq!(table.complete_target(), Some(target("10.0.0.5", 8081)));
    }

    #[test]
    fn test_partial_set_is_not_complete() {
        let listing = "\
-N INTERPOSE
-A OUTPUT -j INTERPOSE
-A INTERPOSE -p tcp -m tcp --dport 80 -j DNAT --to-destination 10.0.0.5:8081
";
        let table = NatTable::parse(listing);
        assert!(table.has_redirects());
        assert_eq!(table.complete_target(), None);
    }

    #[test]
    fn test_mismatched_destinations_are_not_complete() {
        let listing = "\
-N INTERPOSE
-A OUTPUT -j INTERPOSE
-A INTERPOSE -p tcp -m tcp --dport 80 -j DNAT --to-destination 10.0.0.5:8081
-A INTERPOSE -p tcp -m tcp --dport 443 -j DNAT --to-destination 10.0.0.6:8081
";
        assert_eq!(NatTable::parse(listing).complete_target(), None);
    }

    #[test]
    fn test_classify_permission_denied() {
        let output = ShellOutput {
            status: 1,
            stdout: String::new(),
            stderr: "su: Permission denied\n".into(),
        };
        assert_eq!(
            classify(output).unwrap_err(),
            CommandError::PermissionDenied("su: Permission denied".into())
        );

        let output = ShellOutput {
            status: 4,
            stdout: String::new(),
            stderr: "iptables: Resource temporarily unavailable.".into(),
        };
        assert_eq!(classify(output).unwrap_err().kind(), "command_failed");
    }

    #[test]
    fn test_apply_installs_pair() {
        let fake = FakeIptables::new();
        let rules = controller(&fake);

        rules.apply(&target("10.0.0.5", 8081)).unwrap();

        let expected = target("10.0.0.5", 8081);
        assert_eq!(fake.destinations(), vec![(80, expected), (443, expected)]);
        assert!(rules.probe());
        assert_eq!(rules.probe_target(), Some(target("10.0.0.5", 8081)));
    }

    #[test]
    fn test_apply_twice_has_no_duplicates() {
        let fake = FakeIptables::new();
        let rules = controller(&fake);

        rules.apply(&target("10.0.0.5", 8081)).unwrap();
        rules.apply(&target("10.0.0.5", 8081)).unwrap();

        let table = rules.inspect().unwrap();
        assert_eq!(table.rules.len(), 2);
        assert_eq!(table.jumps, 1);
    }

    #[test]
    fn test_apply_replaces_previous_target() {
        let fake = FakeIptables::new();
        let rules = controller(&fake);

        rules.apply(&target("10.0.0.5", 8081)).unwrap();
        rules.apply(&target("10.0.0.5", 9090)).unwrap();

        assert_eq!(rules.probe_target(), Some(target("10.0.0.5", 9090)));
        assert_eq!(fake.installed_rules().len(), 2);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let fake = FakeIptables::new();
        let rules = controller(&fake);

        rules.clear().unwrap();
        assert!(fake.installed_rules().is_empty());
        assert_eq!(fake.mutation_sessions(), 0);

        rules.apply(&target("10.0.0.5", 8081)).unwrap();
        rules.clear().unwrap();
        rules.clear().unwrap();

        let table = rules.inspect().unwrap();
        assert!(!table.chain_present);
        assert_eq!(table.jumps, 0);
        assert!(!rules.probe());
    }

    #[test]
    fn test_mid_batch_failure_rolls_back() {
        let fake = FakeIptables::new();
        fake.fail_commands_containing("--dport 443");
        let rules = controller(&fake);

        let err = rules.apply(&target("10.0.0.5", 8081)).unwrap_err();
        assert_eq!(err.kind(), "command_failed");
        assert!(fake.installed_rules().is_empty());
        assert!(!rules.probe());
    }

    #[test]
    fn test_failed_replace_restores_previous_target() {
        let fake = FakeIptables::new();
        let rules = controller(&fake);
        rules.apply(&target("10.0.0.5", 8081)).unwrap();

        fake.fail_commands_containing("--to-destination 10.0.0.9");
        let err = rules.apply(&target("10.0.0.9", 8081)).unwrap_err();

        assert_eq!(err.kind(), "command_failed");
        assert_eq!(rules.probe_target(), Some(target("10.0.0.5", 8081)));

        fake.clear_failures();
        rules.apply(&target("10.0.0.9", 8081)).unwrap();
        assert_eq!(rules.probe_target(), Some(target("10.0.0.9", 8081)));
    }

    #[test]
    fn test_unverifiable_apply_removes_new_rules() {
        let fake = FakeIptables::new();
        fake.fail_listings_after(1);
        let rules = controller(&fake);

        let err = rules.apply(&target("10.0.0.5", 8081)).unwrap_err();
        assert_eq!(err.kind(), "command_failed");
        assert!(fake.destinations().is_empty());
        assert!(fake.output_rules().is_empty());

        fake.fail_listing(false);
        let table = rules.inspect().unwrap();
        assert!(!table.chain_present);
        assert_eq!(table.jumps, 0);
    }

    #[test]
    fn test_unverifiable_apply_keeps_existing_chain() {
        let fake = FakeIptables::new();
        let setup: Vec<String> = [
            format!("-N {}", RULE_CHAIN),
            format!("-A OUTPUT -j {}", RULE_CHAIN),
        ]
        .iter()
        .map(nat)
        .collect();
        assert!(fake.run(&setup).unwrap().success());
        let rules = controller(&fake);

        fake.fail_listings_after(1);
        rules.apply(&target("10.0.0.7", 8081)).unwrap_err();

        assert!(fake.destinations().is_empty());
        assert_eq!(fake.output_rules(), vec![format!("-j {}", RULE_CHAIN)]);
        fake.fail_listing(false);
        assert!(rules.inspect().unwrap().chain_present);
    }

    #[test]
    fn test_clear_keeps_foreign_output_rules() {
        let fake = FakeIptables::new();
        let foreign = "! -d 127.0.0.0/8 -m addrtype --dst-type LOCAL -j DOCKER";
        fake.add_output_rule(foreign);
        let rules = controller(&fake);

        rules.apply(&target("10.0.0.5", 8081)).unwrap();
        assert_eq!(rules.probe_target(), Some(target("10.0.0.5", 8081)));
        assert_eq!(fake.output_rules().len(), 2);

        rules.clear().unwrap();
        assert_eq!(fake.output_rules(), vec![foreign.to_string()]);
        assert!(!rules.probe());
    }

    #[cfg(unix)]
    #[test]
    fn test_refusing_helper_is_permission_denied() {
        let shell = crate::shell::CommandShell::new(
            "sh",
            ["-c", "echo 'sudo: a password is required' >&2; exit 1"],
        );
        let rules = RuleController::new(Arc::new(shell));

        for _ in 0..50 {
            let err = rules.apply(&target("10.0.0.5", 8081)).unwrap_err();
            assert_eq!(err.kind(), "permission_denied");
        }
        assert!(!rules.probe());
    }

    #[test]
    fn test_denied_apply_reports_permission_denied() {
        let fake = FakeIptables::new();
        fake.deny(true);
        let rules = controller(&fake);

        let err = rules.apply(&target("10.0.0.5", 8081)).unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[test]
    fn test_probe_failure_reads_inactive() {
        let fake = FakeIptables::new();
        fake.preinstall(target("10.0.0.5", 8081));
        fake.fail_listing(true);
        let rules = controller(&fake);

        assert!(!rules.probe());
        assert_eq!(rules.probe_target(), None);
    }
}

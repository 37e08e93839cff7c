use netpol_controller_core::Family;
use std::{
    io,
    path::PathBuf,
    process::{Command, Output},
};

/// Where a rule is placed in its chain when it is not already present.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Position {
    Append,

    /// 1-based.
    Insert(u32),
}

/// Manages the chains and rules of a single address family's packet filter.
///
/// Every operation is idempotent.
pub trait PacketFilter {
    fn has_chain(&self, table: &str, chain: &str) -> Result<bool, Error>;

    /// Creates `chain` in `table` unless it exists.
    fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), Error>;

    /// Removes every rule from `chain`.
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error>;

    /// Adds the rule described by `args` to `chain` unless an identical rule exists.
    fn ensure_rule(
        &self,
        position: Position,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<(), Error>;

    /// Removes the rule described by `args` from `chain` if it exists.
    fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<(), Error>;
}

/// Drives the `iptables` or `ip6tables` command.
#[derive(Clone, Debug)]
pub struct Iptables {
    program: PathBuf,
    family: Family,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} {args} exited with {status}: {stderr}")]
    Failed {
        program: String,
        args: String,
        status: String,
        stderr: String,
    },
}

// === impl Iptables ===

impl Iptables {
    pub fn new(program: impl Into<PathBuf>, family: Family) -> Self {
        Self {
            program: program.into(),
            family,
        }
    }

    fn run(&self, args: &[String]) -> Result<Output, Error> {
        tracing::trace!(
            family = %self.family,
            program = %self.program.display(),
            ?args,
            "Running"
        );
        Command::new(&self.program)
            .arg("-w")
            .args(args)
            .output()
            .map_err(|source| Error::Exec {
                program: self.program.display().to_string(),
                source,
            })
    }

    fn run_ok(&self, args: &[String]) -> Result<(), Error> {
        let output = self.run(args)?;
        if output.status.success() {
            return Ok(());
        }
        Err(self.failed(args, &output))
    }

    /// Runs `iptables -C`, which exits with 1 when the rule is absent.
    fn has_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<bool, Error> {
        let check = check_rule_args(table, chain, args);
        let output = self.run(&check)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.failed(&check, &output)),
        }
    }

    fn failed(&self, args: &[String], output: &Output) -> Error {
        Error::Failed {
            program: self.program.display().to_string(),
            args: args.join(" "),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

impl PacketFilter for Iptables {
    fn has_chain(&self, table: &str, chain: &str) -> Result<bool, Error> {
        let list = list_chain_args(table, chain);
        let output = self.run(&list)?;
        match output.status.code() {
            Some(0) => Ok(true),
            // No chain by that name.
            Some(1) => Ok(false),
            _ => Err(self.failed(&list, &output)),
        }
    }

    fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        if self.has_chain(table, chain)? {
            return Ok(());
        }
        self.run_ok(&new_chain_args(table, chain))
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.run_ok(&flush_chain_args(table, chain))
    }

    fn ensure_rule(
        &self,
        position: Position,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<(), Error> {
        if self.has_rule(table, chain, args)? {
            return Ok(());
        }
        self.run_ok(&add_rule_args(position, table, chain, args))
    }

    fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<(), Error> {
        if !self.has_rule(table, chain, args)? {
            return Ok(());
        }
        self.run_ok(&delete_rule_args(table, chain, args))
    }
}

fn table_args(table: &str, op: &str, chain: &str) -> Vec<String> {
    vec![
        "-t".to_string(),
        table.to_string(),
        op.to_string(),
        chain.to_string(),
    ]
}

fn list_chain_args(table: &str, chain: &str) -> Vec<String> {
    let mut args = table_args(table, "-L", chain);
    args.push("-n".to_string());
    args
}

fn new_chain_args(table: &str, chain: &str) -> Vec<String> {
    table_args(table, "-N", chain)
}

fn flush_chain_args(table: &str, chain: &str) -> Vec<String> {
    table_args(table, "-F", chain)
}

fn check_rule_args(table: &str, chain: &str, rule: &[String]) -> Vec<String> {
    let mut args = table_args(table, "-C", chain);
    args.extend_from_slice(rule);
    args
}

fn delete_rule_args(table: &str, chain: &str, rule: &[String]) -> Vec<String> {
    let mut args = table_args(table, "-D", chain);
    args.extend_from_slice(rule);
    args
}

fn add_rule_args(position: Position, table: &str, chain: &str, rule: &[String]) -> Vec<String> {
    let mut args = match position {
        Position::Append => table_args(table, "-A", chain),
        Position::Insert(n) => {
            let mut args = table_args(table, "-I", chain);
            args.push(n.to_string());
            args
        }
    };
    args.extend_from_slice(rule);
    args
}

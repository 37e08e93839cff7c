//! Installs compiled rule sets into workloads' network namespaces.
//!
//! Provisioning a [`RuleSet`] enters the workload's namespace and, for each address family:
//!
//! 1. creates and flushes each dynamic chain that has rules, and jumps to it from the top of
//!    `INPUT` (ingress) or `OUTPUT` (egress); a dynamic chain left over from an earlier run that
//!    no longer has rules is flushed and its jump removed;
//! 2. appends the chain's rules followed by a `RETURN`;
//! 3. installs the baseline: loopback traffic is accepted and everything else is rejected in
//!    `INPUT`, `OUTPUT` and `FORWARD`.
//!
//! Chain and rule operations are idempotent, so provisioning the same rule set again leaves a
//! single copy of every rule.

#![deny(warnings, rust_2018_idioms)]
#![deny(unsafe_code)]

mod iptables;
mod netns;


pub use self::{
    iptables::{Error as FilterError, Iptables, PacketFilter, Position},
    netns::{Netns, Setns, SetnsGuard},
};
use netpol_controller_core::{
    Chain, Family, Rule, RuleSet, FILTER_TABLE, FORWARD_CHAIN, INPUT_CHAIN, OUTPUT_CHAIN,
};
use std::{
    future::Future,
    io,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    thread,
};
use tokio::sync::oneshot;

/// Installs rule sets through one packet filter per address family.
#[derive(Debug)]
pub struct Provisioner<N, F> {
    netns: N,
    v4: F,
    v6: F,
}

/// The outcome of a provisioning run that was not aborted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Rules that are in place.
    pub installed: usize,

    /// Rules that could not be installed.
    pub failed: usize,
}

/// Resolves when a spawned provisioning run completes.
#[derive(Debug)]
pub struct Provisioning {
    rx: oneshot::Receiver<Result<Report, Error>>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to enter network namespace {}: {source}", .path.display())]
    Netns {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare {family} chain {chain}: {source}")]
    Chain {
        family: Family,
        chain: &'static str,
        #[source]
        source: FilterError,
    },

    #[error("failed to spawn provisioning thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("provisioning thread panicked")]
    Panicked,
}

// === impl Provisioner ===

impl<N: Netns, F: PacketFilter> Provisioner<N, F> {
    pub fn new(netns: N, v4: F, v6: F) -> Self {
        Self { netns, v4, v6 }
    }

    /// Installs `rules` into their network namespace on the calling thread.
    ///
    /// The calling thread's namespace is restored before this returns, including when it unwinds.
    /// Failing to enter the namespace or to prepare a chain aborts the run; failing to install an
    /// individual rule is logged and counted in the returned [`Report`].
    pub fn provision(&self, rules: &RuleSet) -> Result<Report, Error> {
        let netns = rules.netns.display();
        let _span = tracing::info_span!("provision", %netns).entered();

        let _guard = self.netns.enter(&rules.netns).map_err(|source| {
            tracing::error!(error = %source, "Failed to enter network namespace");
            Error::Netns {
                path: rules.netns.clone(),
                source,
            }
        })?;

        let (chains, retired) = rules
            .chains()
            .into_iter()
            .partition::<Vec<_>, _>(|chain| !chain.rules.is_empty());
        for chain in &retired {
            self.retire_chain(chain)?;
        }
        for chain in &chains {
            self.prepare_chain(chain)?;
        }

        let mut report = Report::default();
        let returning = Rule::returning();
        for chain in &chains {
            let filter = self.filter(chain.family);
            for rule in chain.rules.iter().chain(Some(&returning)) {
                report.record(chain.family, chain.name, install(filter, chain.name, rule));
            }
        }

        for family in [Family::V4, Family::V6] {
            let filter = self.filter(family);
            for (chain, rule) in baseline() {
                report.record(family, chain, install(filter, chain, &rule));
            }
        }

        tracing::info!(
            installed = report.installed,
            failed = report.failed,
            "Provisioned"
        );
        Ok(report)
    }

    /// Creates and flushes a dynamic chain and ensures traffic jumps to it ahead of the baseline.
    fn prepare_chain(&self, chain: &Chain) -> Result<(), Error> {
        let filter = self.filter(chain.family);
        let builtin = chain.direction.builtin_chain();
        filter
            .ensure_chain(FILTER_TABLE, chain.name)
            .and_then(|()| filter.flush_chain(FILTER_TABLE, chain.name))
            .and_then(|()| {
                filter.ensure_rule(
                    Position::Insert(1),
                    FILTER_TABLE,
                    builtin,
                    &Rule::jump(chain.name).args(),
                )
            })
            .map_err(|source| chain_error(chain, source))
    }

    /// Empties a dynamic chain that no longer has rules, if an earlier run created it, and
    /// stops traffic from jumping to it.
    fn retire_chain(&self, chain: &Chain) -> Result<(), Error> {
        let filter = self.filter(chain.family);
        let builtin = chain.direction.builtin_chain();
        match filter.has_chain(FILTER_TABLE, chain.name) {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(source) => return Err(chain_error(chain, source)),
        }
        tracing::debug!(family = %chain.family, chain = chain.name, "Retiring chain");
        filter
            .flush_chain(FILTER_TABLE, chain.name)
            .and_then(|()| {
                filter.delete_rule(FILTER_TABLE, builtin, &Rule::jump(chain.name).args())
            })
            .map_err(|source| chain_error(chain, source))
    }

    fn filter(&self, family: Family) -> &F {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }
}

impl<N, F> Provisioner<N, F>
where
    N: Netns + Send + Sync + 'static,
    F: PacketFilter + Send + Sync + 'static,
{
    /// Provisions `rules` on a dedicated thread, which holds the workload's namespace until the
    /// run completes.
    pub fn spawn(self: &Arc<Self>, rules: RuleSet) -> Provisioning {
        let (tx, rx) = oneshot::channel();
        let provisioner = self.clone();
        let spawned = thread::Builder::new()
            .name("provisioner".to_string())
            .spawn(move || {
                let res = panic::catch_unwind(AssertUnwindSafe(|| provisioner.provision(&rules)))
                    .unwrap_or(Err(Error::Panicked));
                // The caller may have stopped waiting for the outcome.
                let _ = tx.send(res);
            });

        match spawned {
            Ok(_) => Provisioning { rx },
            Err(error) => Provisioning::failed(Error::Spawn(error)),
        }
    }
}

fn chain_error(chain: &Chain, source: FilterError) -> Error {
    tracing::error!(
        family = %chain.family,
        chain = chain.name,
        error = %source,
        "Failed to prepare chain",
    );
    Error::Chain {
        family: chain.family,
        chain: chain.name,
        source,
    }
}

fn install<F: PacketFilter>(
    filter: &F,
    chain: &'static str,
    rule: &Rule,
) -> Result<(), FilterError> {
    filter.ensure_rule(Position::Append, FILTER_TABLE, chain, &rule.args())
}

/// Accepts loopback traffic and rejects everything else.
fn baseline() -> [(&'static str, Rule); 6] {
    [
        (
            INPUT_CHAIN,
            Rule {
                in_iface: Some("lo".to_string()),
                ..Rule::default()
            },
        ),
        (
            OUTPUT_CHAIN,
            Rule {
                out_iface: Some("lo".to_string()),
                ..Rule::default()
            },
        ),
        (
            FORWARD_CHAIN,
            Rule {
                in_iface: Some("lo".to_string()),
                ..Rule::default()
            },
        ),
        (INPUT_CHAIN, Rule::reject()),
        (OUTPUT_CHAIN, Rule::reject()),
        (FORWARD_CHAIN, Rule::reject()),
    ]
}

// === impl Report ===

impl Report {
    fn record(&mut self, family: Family, chain: &str, res: Result<(), FilterError>) {
        match res {
            Ok(()) => self.installed += 1,
            Err(error) => {
                tracing::warn!(%family, chain, %error, "Failed to install rule");
                self.failed += 1;
            }
        }
    }
}

// === impl Provisioning ===

impl Provisioning {
    fn failed(error: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }
}

impl Future for Provisioning {
    type Output = Result<Report, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::Panicked)))
    }
}

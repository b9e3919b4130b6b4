//! Immutable configuration chain
//!
//! A chain is an ordered list of shared nodes. Pushing a node copies the
//! list of `Arc`s and leaves the original untouched; resolving folds every
//! node over a fresh copy of a default template, root first.

use crate::connection::{ConnectionTemplate, SslStage, TlsContext, Transport};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Template transformation
pub(crate) type TemplateFn = Arc<dyn Fn(&mut ConnectionTemplate) -> Result<()> + Send + Sync>;

/// TLS stage as captured by a `secure*` mutator
#[derive(Debug, Clone)]
pub(crate) struct SecureSpec {
    context: std::result::Result<TlsContext, Arc<str>>,
    handshake_timeout: Duration,
}

impl SecureSpec {
    pub(crate) fn new(context: Result<TlsContext>, handshake_timeout: Duration) -> Self {
        Self {
            context: context.map_err(|e| Arc::from(e.to_string())),
            handshake_timeout,
        }
    }

    /// Stage for the template, or the captured build failure
    fn stage(&self) -> Result<SslStage> {
        match &self.context {
            Ok(context) => Ok(SslStage::new(context.clone(), self.handshake_timeout)),
            Err(msg) => Err(Error::Tls(msg.to_string())),
        }
    }

    pub(crate) fn context(&self) -> Option<&TlsContext> {
        self.context.as_ref().ok()
    }
}

/// One configuration node
#[derive(Clone)]
pub(crate) enum Op {
    /// Arbitrary template transformation
    Template(TemplateFn),
    /// Install a TLS stage, replacing any earlier one
    Secure(SecureSpec),
    /// Remove the TLS stage
    Unsecure,
    /// SNI override for whichever TLS stage ends up installed
    ServerName(Arc<str>),
    /// Replace the engine
    Transport(Arc<dyn Transport>),
}

impl Op {
    fn apply(&self, template: &mut ConnectionTemplate) -> Result<()> {
        match self {
            Op::Template(f) => f(template),
            Op::Secure(spec) => {
                template.set_tls(Some(spec.stage()?));
                Ok(())
            }
            Op::Unsecure => {
                template.set_tls(None);
                Ok(())
            }
            Op::Transport(_) | Op::ServerName(_) => Ok(()),
        }
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Template(_) => f.write_str("Template"),
            Op::Secure(spec) => f.debug_tuple("Secure").field(spec).finish(),
            Op::Unsecure => f.write_str("Unsecure"),
            Op::ServerName(name) => f.debug_tuple("ServerName").field(name).finish(),
            Op::Transport(t) => f.debug_tuple("Transport").field(t).finish(),
        }
    }
}

/// Ordered, shared list of nodes
#[derive(Clone, Default)]
pub(crate) struct Chain {
    ops: Arc<Vec<Op>>,
}

impl Chain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A new chain with `op` appended
    pub(crate) fn push(&self, op: Op) -> Self {
        let mut ops = Vec::with_capacity(self.ops.len() + 1);
        ops.extend(self.ops.iter().cloned());
        ops.push(op);
        Self { ops: Arc::new(ops) }
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// Fold every node over a copy of `base`, then apply the nearest SNI
    /// override to the final TLS stage
    pub(crate) fn resolve(&self, base: &ConnectionTemplate) -> Result<ConnectionTemplate> {
        let mut template = self.ops.iter().try_fold(base.clone(), |mut template, op| {
            op.apply(&mut template)?;
            Ok::<_, Error>(template)
        })?;
        if let Some(name) = self.server_name() {
            let stage = template
                .tls()
                .cloned()
                .ok_or_else(|| Error::Config("server name requires a TLS stage".into()))?;
            template.set_tls(Some(stage.with_server_name(name)));
        }
        Ok(template)
    }

    fn server_name(&self) -> Option<&str> {
        self.ops.iter().rev().find_map(|op| match op {
            Op::ServerName(name) => Some(&**name),
            _ => None,
        })
    }

    /// Nearest secure/unsecure node, `None` for unsecure or absent
    pub(crate) fn secure_spec(&self) -> Option<&SecureSpec> {
        self.ops.iter().rev().find_map(|op| match op {
            Op::Secure(spec) => Some(Some(spec)),
            Op::Unsecure => Some(None),
            _ => None,
        })?
    }

    /// Nearest engine override
    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.ops.iter().rev().find_map(|op| match op {
            Op::Transport(t) => Some(t.clone()),
            _ => None,
        })
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ops.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RemoteAddress;

    fn set_port(port: u16) -> Op {
        Op::Template(Arc::new(move |t: &mut ConnectionTemplate| {
            let remote = t.remote().with_port(port);
            t.set_remote(remote);
            Ok(())
        }))
    }

    #[test]
    fn test_push_leaves_original_untouched() {
        let root = Chain::new();
        let a = root.push(set_port(1));
        let b = a.push(set_port(2));

        assert_eq!(root.len(), 0);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_resolve_applies_root_first() {
        let chain = Chain::new().push(set_port(1)).push(set_port(2));
        let template = chain.resolve(ConnectionTemplate::client_default()).unwrap();
        assert_eq!(template.remote().port(), 2);
    }

    #[test]
    fn test_resolve_stops_at_first_error() {
        let chain = Chain::new()
            .push(Op::Template(Arc::new(|_: &mut ConnectionTemplate| {
                Err(Error::Config("boom".into()))
            })))
            .push(set_port(9));
        assert!(matches!(
            chain.resolve(ConnectionTemplate::client_default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_failed_secure_spec_surfaces_as_tls_error() {
        let spec = SecureSpec::new(Err(Error::Tls("bad CA".into())), Duration::from_secs(1));
        assert!(spec.context().is_none());
        let chain = Chain::new().push(Op::Secure(spec));
        let err = chain.resolve(ConnectionTemplate::client_default()).unwrap_err();
        assert!(err.to_string().contains("bad CA"));
    }

    #[test]
    fn test_nearest_secure_node_wins() {
        let ctx = TlsContext::builder().build().unwrap();
        let secure = Op::Secure(SecureSpec::new(Ok(ctx), Duration::from_secs(1)));

        let chain = Chain::new().push(secure.clone());
        assert!(chain.secure_spec().is_some());

        let chain = chain.push(Op::Unsecure);
        assert!(chain.secure_spec().is_none());

        let chain = chain.push(set_port(1)).push(secure);
        assert!(chain.secure_spec().is_some());
    }

    #[test]
    fn test_server_name_survives_later_secure_node() {
        let ctx = TlsContext::builder().build().unwrap();
        let secure = Op::Secure(SecureSpec::new(Ok(ctx), Duration::from_secs(1)));
        let chain = Chain::new()
            .push(secure.clone())
            .push(Op::ServerName("db.internal".into()))
            .push(secure);

        let template = chain.resolve(ConnectionTemplate::client_default()).unwrap();
        assert_eq!(template.tls().unwrap().server_name(), Some("db.internal"));
    }

    #[test]
    fn test_base_template_is_not_modified() {
        let chain = Chain::new().push(Op::Template(Arc::new(|t: &mut ConnectionTemplate| {
            t.set_remote(RemoteAddress::from_host("example.com", 1));
            Ok(())
        })));
        let _ = chain.resolve(ConnectionTemplate::client_default()).unwrap();
        assert_eq!(ConnectionTemplate::client_default().remote().host(), "localhost");
    }
}

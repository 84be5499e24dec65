use std::str::FromStr;

use crate::{
    model::{Address, NodeId},
    protocol::transport::TransportService,
};

/// Where an envelope goes once its destination is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Control(NodeId),
    Endpoint(String),
}

/// Resolves destinations against the transports of a runtime.
#[derive(Debug, Clone)]
pub struct Router {
    transport: TransportService,
}

impl Router {
    pub fn new(transport: TransportService) -> Self {
        Self { transport }
    }
    /// Control routes are derived from the node id and never need a lookup, endpoint routes have
    /// to be served by the transport.
    pub fn resolve(&self, destination: &Address) -> crate::Result<Route> {
        match destination {
            Address::Control(node) => Ok(Route::Control(*node)),
            Address::Endpoint(uri) if self.transport.accepts(destination) => {
                Ok(Route::Endpoint(uri.clone()))
            }
            Address::Endpoint(_) => Err(crate::Error::unknown_destination(destination)),
        }
    }
    /// Parse and resolve a textual destination.
    pub fn resolve_str(&self, destination: &str) -> crate::Result<(Address, Route)> {
        let address = Address::from_str(destination)
            .map_err(|e| crate::Error::unknown_destination(e.input))?;
        let route = self.resolve(&address)?;
        Ok((address, route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, protocol::transport::LocalTransport};

    #[test]
    fn test_resolve() {
        let router = Router::new(TransportService::new(LocalTransport::new()));
        let node = NodeId::new_indexed(3);
        assert_eq!(
            router.resolve(&node.control_address()).unwrap(),
            Route::Control(node)
        );
        let (_, route) = router.resolve_str("local://orders").unwrap();
        assert_eq!(route, Route::Endpoint("local://orders".into()));
        for bad in ["tcp://10.0.0.1:80", "orders", "control://nobody"] {
            let error = router.resolve_str(bad).unwrap_err();
            assert!(matches!(error.kind, ErrorKind::UnknownDestination(_)), "{bad}");
        }
    }
}

/// Run `$body` with `$store` bound to the resource store registered under
/// `$kind`, or fail with `UnknownKind`.
macro_rules! with_store {
    ($stores:expr, $kind:expr, |$store:ident| $body:expr) => {{
        use pkg_types::Resource as _;
        let stores = &$stores;
        let kind: &str = $kind;
        if kind == pkg_types::node::Node::KIND {
            let $store = &stores.nodes;
            $body
        } else if kind == pkg_types::network::LogicalNetwork::KIND {
            let $store = &stores.networks;
            $body
        } else if kind == pkg_types::port::LogicalPort::KIND {
            let $store = &stores.ports;
            $body
        } else if kind == pkg_types::namespace::Namespace::KIND {
            let $store = &stores.namespaces;
            $body
        } else if kind == pkg_types::pod::Pod::KIND {
            let $store = &stores.pods;
            $body
        } else if kind == pkg_types::service::Service::KIND {
            let $store = &stores.services;
            $body
        } else if kind == pkg_types::endpoint::Endpoints::KIND {
            let $store = &stores.endpoints;
            $body
        } else if kind == pkg_types::network_policy::NetworkPolicy::KIND {
            let $store = &stores.policies;
            $body
        } else {
            Err($crate::ApiError::UnknownKind(kind.to_string()))
        }
    }};
}

pub mod admin;
pub mod cluster;
pub mod ipam;
pub mod resources;
pub mod watch;

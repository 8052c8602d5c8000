//! A small routing-table app: lookups pick the highest priority among the
//! matching prefixes and break ties by the longest one.

mod common;

use async_trait::async_trait;
use beehive_core::{Error, MappedCells, Message, Msg, Result};
use beehive_runtime::{App, Handler, MapContext, RcvContext};
use beehive_transport::MemoryNetwork;
use common::*;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

const ROUTES: &str = "routes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Route {
    prefix: Ipv4Addr,
    len: u8,
    prio: u32,
    name: String,
}

impl Route {
    fn new(prefix: [u8; 4], len: u8, prio: u32, name: &str) -> Self {
        Self {
            prefix: Ipv4Addr::from(prefix),
            len,
            prio,
            name: name.to_string(),
        }
    }

    fn mask(&self) -> u32 {
        match self.len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len.min(32))),
        }
    }

    fn matches(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.prefix) & self.mask()
    }

    fn key(&self) -> String {
        format!("{}/{}", self.prefix, self.len)
    }
}

impl Message for Route {
    const TYPE_NAME: &'static str = "routes.add";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lookup {
    addr: Ipv4Addr,
}

impl Message for Lookup {
    const TYPE_NAME: &'static str = "routes.lookup";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Found {
    route: Option<Route>,
}

impl Message for Found {
    const TYPE_NAME: &'static str = "routes.found";
}

struct RouteTable;

#[async_trait]
impl Handler for RouteTable {
    fn map(&self, _msg: &Msg, _ctx: &MapContext<'_>) -> MappedCells {
        MappedCells::single(ROUTES, "table")
    }

    async fn rcv(&self, msg: &Msg, ctx: &mut RcvContext) -> Result<()> {
        if let Ok(route) = msg.data::<Route>() {
            ctx.dict(ROUTES).put_value(route.key(), &route)?;
            return ctx.reply_to(msg, Found { route: Some(route) });
        }

        let Lookup { addr } = msg.data::<Lookup>()?;
        let mut best: Option<Route> = None;
        ctx.dict(ROUTES)
            .for_each(|_, value| {
                let route: Route = serde_json::from_slice(value).map_err(Error::serialization)?;
                if !route.matches(addr) {
                    return Ok(());
                }
                let better = match &best {
                    None => true,
                    Some(b) => (route.prio, route.len) > (b.prio, b.len),
                };
                if better {
                    best = Some(route);
                }
                Ok(())
            })
            .await?;
        ctx.reply_to(msg, Found { route: best })
    }
}

fn routes_app() -> Vec<App> {
    vec![App::new("routes")
        .unwrap()
        .handle::<Route>(RouteTable)
        .handle::<Lookup>(RouteTable)]
}

async fn add(hive: &beehive_runtime::Hive, route: Route) {
    let found: Found = hive.process_as(&ctx(), route).await.unwrap();
    assert!(found.route.is_some());
}

async fn lookup(hive: &beehive_runtime::Hive, addr: [u8; 4]) -> Option<String> {
    let lookup = Lookup {
        addr: Ipv4Addr::from(addr),
    };
    let found: Found = hive.process_as(&ctx(), lookup).await.unwrap();
    found.route.map(|r| r.name)
}

#[test]
fn test_route_matching() {
    let default = Route::new([0, 0, 0, 0], 0, 1, "default");
    assert!(default.matches(Ipv4Addr::new(8, 8, 8, 8)));

    let net = Route::new([10, 1, 0, 0], 16, 1, "net");
    assert!(net.matches(Ipv4Addr::new(10, 1, 200, 3)));
    assert!(!net.matches(Ipv4Addr::new(10, 2, 0, 1)));

    let host = Route::new([10, 1, 2, 3], 32, 1, "host");
    assert!(host.matches(Ipv4Addr::new(10, 1, 2, 3)));
    assert!(!host.matches(Ipv4Addr::new(10, 1, 2, 4)));
}

#[tokio::test]
async fn test_longest_match_wins_at_equal_priority() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 1, routes_app).await;
    let hive = &hives[0];

    add(hive, Route::new([0, 0, 0, 0], 8, 1, "short")).await;
    add(hive, Route::new([0, 0, 0, 0], 16, 1, "long")).await;

    assert_eq!(lookup(hive, [0, 0, 1, 1]).await.as_deref(), Some("long"));
    assert_eq!(lookup(hive, [0, 1, 1, 1]).await.as_deref(), Some("short"));
    assert_eq!(lookup(hive, [1, 1, 1, 1]).await, None);

    stop_all(&hives).await;
}

#[tokio::test]
async fn test_priority_beats_length() {
    let network = MemoryNetwork::new();
    let hives = start_cluster(&network, 2, routes_app).await;

    add(&hives[0], Route::new([10, 0, 0, 1], 32, 1, "host")).await;
    add(&hives[1], Route::new([10, 0, 0, 0], 8, 10, "preferred")).await;

    for hive in &hives {
        assert_eq!(lookup(hive, [10, 0, 0, 1]).await.as_deref(), Some("preferred"));
    }

    stop_all(&hives).await;
}

// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Special-function dispatch: the C-callable surface of the distributed
//! layer.
//!
//! The registry is an ordered collection populated at construction; a
//! guest call is checked for arity, every argument is required to evaluate
//! to a concrete integer, and the bound handler runs against the full run
//! environment through [`CallContext`].

use symnet_shared::error::{Error, Result};
use symnet_shared::expr::{self, Array, ExprRef};
use symnet_shared::{Node, Time, FIRST_NODE, INVALID_NODE};

use crate::cache::{DataAtom, PacketCache, PacketInfo};
use crate::config::Config;
use crate::executor::{Executor, StateId, SymbolicObject};
use crate::mapper::StateMapper;
use crate::searcher::{EventKind, Searcher};
use crate::transmit::{self, CacheTransmitter, TransmitHandler};
use crate::txdata::TransmissionKind;

/// How a handled call returns to the guest.
#[derive(Debug)]
pub enum Flow {
    Value(u64),
    Void,
    /// Terminate the calling state's scenario with an early-exit record.
    TerminateEarly(String),
}

/// Borrowed view of the run environment a handler executes against.
pub struct CallContext<'a> {
    pub exec: &'a mut Executor,
    pub mapper: &'a mut StateMapper,
    pub cache: &'a mut PacketCache,
    pub searcher: &'a mut dyn Searcher,
    pub transmit: &'a TransmitHandler,
    pub config: &'a Config,
    /// The active state; the one that made the call.
    pub state: StateId,
    /// Effective phony-packet mode (flag and searcher agree).
    pub phony_packets: bool,
    /// Receivers that became infeasible during an inline cache commit; the
    /// runtime reaps them silently.
    pub infeasible: Vec<StateId>,
}

impl CallContext<'_> {
    fn node(&self) -> Node {
        self.mapper.state_node(self.state)
    }

    /// Read a NUL-terminated guest string.
    fn read_string(&self, state: StateId, addr: u64) -> String {
        let (mo, offset) = self
            .exec
            .memory
            .resolve(addr)
            .expect("string address does not resolve");
        let os = self
            .exec
            .state(state)
            .address_space
            .find(mo.id)
            .expect("string object not bound on state");
        let mut out = String::new();
        for i in offset..mo.size {
            match os.read8(i).as_const() {
                Some(0) | None => break,
                Some(b) => out.push(b as u8 as char),
            }
        }
        out
    }

    /// Read `len` byte expressions starting at `addr` on `state`; a zero
    /// `len` takes the whole object.
    fn acquire_expr_range(&self, state: StateId, addr: u64, len: usize) -> (Vec<ExprRef>, usize) {
        let (mo, offset) = self
            .exec
            .memory
            .resolve(addr)
            .expect("source address does not resolve");
        let len = if len == 0 { mo.size } else { len };
        assert!(offset + len <= mo.size, "source range exceeds the object");
        let os = self
            .exec
            .state(state)
            .address_space
            .find(mo.id)
            .expect("source object not bound on state");
        ((0..len).map(|i| os.read8(offset + i)).collect(), len)
    }

    /// Queue a transmission of `data` into the buffer at `dest_addr` on
    /// every state at `dest_node`, committing immediately unless phony
    /// packets are allowed to stay pending.
    fn memory_transfer(
        &mut self,
        dest_addr: u64,
        dest_len: usize,
        data: Vec<DataAtom>,
        dest_node: Node,
    ) -> Result<()> {
        let (mo, offset) = self
            .exec
            .memory
            .resolve(dest_addr)
            .expect("destination address does not resolve");
        let pi = PacketInfo {
            addr: dest_addr,
            offset: offset as u64,
            length: dest_len,
            dest_mo: mo.id,
            src: self.node(),
            dest: dest_node,
        };
        self.cache.cache_packet(self.state, pi, &data);
        if !self.phony_packets {
            // the searcher will not commit for us
            self.commit_cache()?;
        }
        Ok(())
    }

    /// Drain the packet cache now.
    pub fn commit_cache(&mut self) -> Result<()> {
        let mut tx = CacheTransmitter {
            handler: self.transmit,
            infeasible: Vec::new(),
        };
        self.cache.commit(self.exec, self.mapper, &mut tx)?;
        self.infeasible.extend(tx.infeasible);
        Ok(())
    }
}

type Handler = fn(&mut CallContext<'_>, &[u64]) -> Result<Flow>;

pub struct HandlerInfo {
    pub name: &'static str,
    pub num_args: usize,
    pub has_return: bool,
    handler: Handler,
}

/// The ordered handler table. Built once per run environment.
pub struct Registry {
    handlers: Vec<HandlerInfo>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut r = Registry {
            handlers: Vec::new(),
        };
        r.bind("kn_get_node_id", 0, true, kn_get_node_id);
        r.bind("kn_set_node_id", 1, false, kn_set_node_id);
        r.bind("kn_memcpy", 4, false, kn_memcpy);
        r.bind("kn_memset", 4, false, kn_memset);
        r.bind("kn_reverse_memcpy", 4, false, kn_reverse_memcpy);
        r.bind("kn_get_global_symbol", 4, false, kn_get_global_symbol);
        r.bind("kn_early_exit", 1, false, kn_early_exit);
        r.bind("kn_get_virtual_time", 0, true, kn_get_virtual_time);
        r.bind("kn_schedule_boot_state", 1, false, kn_schedule_boot_state);
        r.bind("kn_schedule_state", 1, false, kn_schedule_state);
        r.bind("kn_wakeup_dest_states", 1, false, kn_wakeup_dest_states);
        r.bind("kn_yield_state", 0, false, kn_yield_state);
        r.bind("kn_barrier", 0, false, kn_barrier);
        r.bind("kn_get_state", 0, true, kn_get_state);
        r.bind("kn_dump_constraints", 0, false, kn_dump_constraints);
        r
    }

    fn bind(&mut self, name: &'static str, num_args: usize, has_return: bool, handler: Handler) {
        self.handlers.push(HandlerInfo {
            name,
            num_args,
            has_return,
            handler,
        });
    }

    pub fn lookup(&self, name: &str) -> Option<&HandlerInfo> {
        self.handlers.iter().find(|h| h.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.iter().map(|h| h.name)
    }

    /// Dispatch a guest call. Every argument must evaluate to a concrete
    /// integer or the call fails with [`Error::NonConstArg`].
    pub fn call(&self, ctx: &mut CallContext<'_>, name: &str, args: &[ExprRef]) -> Result<Flow> {
        let info = self
            .lookup(name)
            .unwrap_or_else(|| panic!("unknown special function `{name}`"));
        assert_eq!(
            args.len(),
            info.num_args,
            "wrong number of arguments to `{name}`"
        );
        let mut concrete = Vec::with_capacity(args.len());
        for (i, a) in args.iter().enumerate() {
            match a.as_const() {
                Some(v) => concrete.push(v),
                None => {
                    return Err(Error::NonConstArg {
                        binding: info.name,
                        index: i,
                        count: args.len(),
                    })
                }
            }
        }
        log::trace!(
            "SFH[{} @{}] calling {name}({concrete:?})",
            ctx.state,
            ctx.node()
        );
        (info.handler)(ctx, &concrete)
    }
}

fn kn_get_node_id(ctx: &mut CallContext<'_>, _args: &[u64]) -> Result<Flow> {
    Ok(Flow::Value(ctx.node().id() as i64 as u64))
}

fn kn_set_node_id(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let id = args[0] as i64 as i32;
    let node = Node(id);
    if node == INVALID_NODE || node < FIRST_NODE {
        return Err(Error::InvalidNodeId { id });
    }
    if ctx.node().is_valid() {
        // the affiliation is write-once
        return Err(Error::InvalidNodeId { id });
    }
    ctx.mapper.set_state_node(ctx.state, node);
    Ok(Flow::Void)
}

fn kn_memcpy(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let dest_node = Node(args[3] as i64 as i32);
    let len = args[2] as usize;
    assert!(len > 0, "kn_memcpy of zero bytes");
    let (values, len) = ctx.acquire_expr_range(ctx.state, args[1], len);
    let atoms: Vec<DataAtom> = values.iter().map(DataAtom::of).collect();
    ctx.memory_transfer(args[0], len, atoms, dest_node)?;
    Ok(Flow::Void)
}

fn kn_memset(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let dest_node = Node(args[3] as i64 as i32);
    let len = args[2] as usize;
    assert!(len > 0, "kn_memset of zero bytes");
    let atoms = vec![DataAtom::Concrete(args[1] as u8)];
    ctx.memory_transfer(args[0], len, atoms, dest_node)?;
    Ok(Flow::Void)
}

/// Pull: constrain a fresh local buffer to equal the source range of at
/// least one candidate state at the source node, conjoined with that
/// state's constraint set.
fn kn_reverse_memcpy(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let src_node = Node(args[3] as i64 as i32);
    let len = args[2] as usize;
    assert!(len > 0, "kn_reverse_memcpy of zero bytes");
    let me = ctx.state;
    let my_node = ctx.node();

    let pull_no = ctx.exec.state(me).completed_pull_requests + 1;
    let name = format!("pull{}(node{})", pull_no, my_node.id());
    let array = Array::new(name.clone(), len);
    ctx.exec.state_mut(me).array_names.insert(name);
    if ctx.config.add_packet_symbols {
        let mo = ctx.exec.memory.allocate(array.name(), len);
        let st = ctx.exec.state_mut(me);
        st.address_space.bind(&mo).bind_array(&array);
        st.symbolics.push(SymbolicObject {
            array: array.clone(),
            mo: Some(mo.id),
        });
    }
    let accumulation = expr::complete_read(&array);

    let mut requirements = expr::make_false();
    ctx.mapper.find_targets(me, src_node);
    let sources = ctx.mapper.targets().to_vec();
    ctx.mapper.invalidate();
    for source in sources {
        let (seq, _) = ctx.acquire_expr_range(source, args[1], len);
        let extraction = transmit::extract_for(
            ctx.exec,
            (source, src_node),
            (me, my_node),
            TransmissionKind::Pull,
            seq,
            true,
            false,
        )?;
        // the value of this candidate source, under its constraints
        let value = expr::eq(
            accumulation.clone(),
            expr::concat_bytes(extraction.payload.iter().cloned()),
        );
        let constraints = expr::conjunction(extraction.constraints.iter().cloned());
        requirements = expr::or(requirements, expr::and(value, constraints));
        ctx.exec.state_mut(source).completed_pull_requests += 1;
    }

    // bind the fresh symbol into the destination buffer
    let (mo, offset) = ctx
        .exec
        .memory
        .resolve(args[0])
        .expect("destination address does not resolve");
    let os = ctx
        .exec
        .state_mut(me)
        .address_space
        .writable(mo.id)
        .expect("destination object not bound");
    for i in 0..len {
        os.write8(offset + i, expr::read8(&array, i));
    }

    ctx.exec.state_mut(me).constraints.add(requirements);
    ctx.exec.state_mut(me).completed_pull_requests += 1;
    Ok(Flow::Void)
}

/// Copy a named global from the peer at the destination node into every
/// sibling of the calling state, cross-applying constraint sets. The
/// calling state is exploded first so each sibling has a unique peer.
fn kn_get_global_symbol(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let dest = Node(args[3] as i64 as i32);
    assert_ne!(dest, ctx.node(), "destination node equals the calling node");
    let len = args[2] as usize;
    assert!(len > 0, "kn_get_global_symbol of zero bytes");

    let (dest_mo, dest_offset) = ctx
        .exec
        .memory
        .resolve(args[0])
        .expect("destination address does not resolve");
    assert_eq!(dest_offset, 0, "destination offset must be zero");
    let symbol = ctx.read_string(ctx.state, args[1]);
    let global = ctx
        .exec
        .memory
        .find_by_name(&symbol)
        .unwrap_or_else(|| panic!("global symbol '{symbol}' not found"))
        .clone();
    assert_eq!(len, global.size, "size mismatch for '{symbol}'");

    // the request is logically non-mutating, but explosion is still
    // required so that every sibling sees exactly one source
    let mut siblings: Vec<StateId> = Vec::new();
    let all = ctx.mapper.nodes().clone();
    let nuke = std::iter::once(dest).collect();
    ctx.mapper
        .explode_over(&mut *ctx.exec, ctx.state, &all, &nuke, Some(&mut siblings));
    siblings.push(ctx.state);

    for sib in siblings {
        ctx.mapper.find_targets(sib, dest);
        let targets = ctx.mapper.targets().to_vec();
        ctx.mapper.invalidate();
        assert_eq!(targets.len(), 1, "ambiguous peer on the destination node");
        let source = targets[0];
        let bytes: Vec<ExprRef> = {
            let os = ctx
                .exec
                .state(source)
                .address_space
                .find(global.id)
                .expect("global not bound on source");
            (0..len).map(|i| os.read8(i)).collect()
        };
        let wos = ctx
            .exec
            .state_mut(sib)
            .address_space
            .writable(dest_mo.id)
            .expect("destination object not bound on sibling");
        for (i, b) in bytes.into_iter().enumerate() {
            wos.write8(i, b);
        }
        transmit::transfer_constraints(ctx.exec, source, sib)?;
        transmit::transfer_constraints(ctx.exec, sib, source)?;
    }
    Ok(Flow::Void)
}

fn kn_early_exit(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let msg = ctx.read_string(ctx.state, args[0]);
    Ok(Flow::TerminateEarly(msg))
}

fn kn_get_virtual_time(ctx: &mut CallContext<'_>, _args: &[u64]) -> Result<Flow> {
    Ok(Flow::Value(ctx.searcher.state_time(ctx.state)))
}

fn kn_schedule_boot_state(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let state = ctx.state;
    if let Some(ev) = ctx.searcher.as_event_searcher() {
        ev.schedule_state_in(state, args[0] as Time, EventKind::Boot);
    }
    Ok(Flow::Void)
}

fn kn_schedule_state(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let state = ctx.state;
    if let Some(ev) = ctx.searcher.as_event_searcher() {
        ev.schedule_state_in(state, args[0] as Time, EventKind::Normal);
    }
    Ok(Flow::Void)
}

fn kn_wakeup_dest_states(ctx: &mut CallContext<'_>, args: &[u64]) -> Result<Flow> {
    let dest = Node(args[0] as i64 as i32);
    let state = ctx.state;
    if ctx.searcher.as_event_searcher().is_none() {
        return Ok(Flow::Void);
    }
    ctx.mapper.map(&mut *ctx.exec, state, dest);
    ctx.mapper.find_targets(state, dest);
    let targets = ctx.mapper.targets().to_vec();
    ctx.mapper.invalidate();
    let now = ctx.searcher.state_time(state);
    let ev = ctx
        .searcher
        .as_event_searcher()
        .expect("checked event capability above");
    for t in targets {
        ev.schedule_state_at(t, now, EventKind::Normal);
    }
    Ok(Flow::Void)
}

fn kn_yield_state(ctx: &mut CallContext<'_>, _args: &[u64]) -> Result<Flow> {
    let state = ctx.state;
    if let Some(ev) = ctx.searcher.as_event_searcher() {
        ev.yield_state(state);
    }
    Ok(Flow::Void)
}

fn kn_barrier(ctx: &mut CallContext<'_>, _args: &[u64]) -> Result<Flow> {
    ctx.searcher.barrier(ctx.state);
    Ok(Flow::Void)
}

fn kn_get_state(ctx: &mut CallContext<'_>, _args: &[u64]) -> Result<Flow> {
    Ok(Flow::Value(ctx.state.0 as u64))
}

fn kn_dump_constraints(ctx: &mut CallContext<'_>, _args: &[u64]) -> Result<Flow> {
    for c in ctx.exec.state(ctx.state).constraints.iter() {
        log::info!("[{}] {c}", ctx.state);
    }
    Ok(Flow::Void)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_the_bindings_in_order() {
        let r = Registry::new();
        let names: Vec<_> = r.names().collect();
        assert_eq!(names[0], "kn_get_node_id");
        assert!(names.contains(&"kn_reverse_memcpy"));
        assert!(names.contains(&"kn_barrier"));
        assert!(r.lookup("kn_memcpy").unwrap().num_args == 4);
        assert!(r.lookup("kn_get_virtual_time").unwrap().has_return);
        assert!(r.lookup("does_not_exist").is_none());
    }
}

use std::sync::Arc;

use super::{EngineState, Sequencer, SequencerConfig, SequencerError};
use crate::sequencer::mmio::RegId;
use crate::sequencer::request::{RequestDescriptor, RequestKind, RequestStatus};
use crate::sim::log::Logger;
use crate::spm::addr_map::RangeId;
use crate::timeq::Cycle;

fn setup(config: SequencerConfig) -> (Sequencer, EngineState) {
    let state = EngineState::new(config.num_cores, 64, config.track_iteration_parity);
    (Sequencer::new(0, config, Arc::new(Logger::silent())), state)
}

fn store(seq: &mut Sequencer, state: &mut EngineState, reg: RegId, value: u64) -> RequestStatus {
    let mut req = RequestDescriptor::write_u64(0, reg.addr(), value);
    seq.make_request(state, &mut req, 0).unwrap()
}

fn load(seq: &mut Sequencer, state: &mut EngineState, ctx: usize, vaddr: u64, now: Cycle) -> (RequestStatus, RequestDescriptor) {
    let mut req = RequestDescriptor::read(ctx, vaddr, 8);
    let status = seq.make_request(state, &mut req, now).unwrap();
    (status, req)
}

// 64 vertices of 8 bytes at 0x1000, chunks of 16 over 4 cores
fn map_range1(seq: &mut Sequencer, state: &mut EngineState) {
    for (reg, value) in [
        (RegId::DataTypeSize(0), 8),
        (RegId::Stride(0), 8),
        (RegId::NumVertex, 64),
        (RegId::VertexStart(0), 0x1000),
        (RegId::ChunkSize, 16),
        (RegId::EnableTracked(0), 1),
    ] {
        assert_eq!(RequestStatus::Satisfied, store(seq, state, reg, value));
    }
}

#[test]
fn configuration_stores_are_satisfied_in_place() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    map_range1(&mut seq, &mut state);
    let r1 = state.map.range(RangeId::R1);
    assert_eq!((0x1000, 8, 8, true), (r1.base, r1.stride, r1.elem_size, r1.enabled));
    assert_eq!(16, state.map.chunk_size);
    assert_eq!(0, seq.outstanding());
    assert!(seq.take_outbox().is_empty());
    assert_eq!(6, seq.stats().mmio_writes);
}

#[test]
fn chunk_size_beyond_spare_sets_is_rejected() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    state.map.set_chunk_limit(8);
    let mut req = RequestDescriptor::write_u64(0, RegId::ChunkSize.addr(), 16);
    let err = seq.make_request(&mut state, &mut req, 0).unwrap_err();
    assert!(err.to_string().contains("exceeds the scratchpad limit"), "{}", err);
    assert_eq!(1, state.map.chunk_size);
    assert_eq!(RequestStatus::Satisfied, store(&mut seq, &mut state, RegId::ChunkSize, 8));
    assert_eq!(8, state.map.chunk_size);
}

#[test]
fn vertex_load_routes_to_owning_core() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    map_range1(&mut seq, &mut state);
    let (status, _) = load(&mut seq, &mut state, 0, 0x1000 + 8 * 20, 5);
    assert_eq!(RequestStatus::Issued, status);

    let issued = seq.take_outbox();
    assert_eq!(1, issued.len());
    let msg = &issued[0];
    assert_eq!(RequestKind::LdVertexRemote, msg.kind);
    assert_eq!(0x1000 + 8 * 20, msg.line_addr);
    assert_eq!((1, 4, 0), (msg.request.dest_core, msg.request.set, msg.request.slot));
    assert_eq!(1, msg.latency);
    assert_eq!(Some(5 + 500_000), seq.deadlock_check_at());
}

#[test]
fn same_line_requests_alias_until_completion() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    let (first, _) = load(&mut seq, &mut state, 0, 0x5000, 0);
    let (second, _) = load(&mut seq, &mut state, 0, 0x5008, 0);
    assert_eq!(RequestStatus::Issued, first);
    assert_eq!(RequestStatus::Aliased, second);
    assert_eq!(1, seq.outstanding());

    let msg = seq.take_outbox().remove(0);
    assert_eq!(RequestKind::Ld, msg.kind);
    assert_eq!(0x5000, msg.line_addr);
    seq.callback(&mut state, msg, 3).unwrap();
    assert_eq!(0, seq.outstanding());
    let done = seq.take_completions();
    assert_eq!(1, done.len());
    assert_eq!(3, done[0].latency);

    let (retry, _) = load(&mut seq, &mut state, 0, 0x5008, 4);
    assert_eq!(RequestStatus::Issued, retry);
}

#[test]
fn admission_stops_at_outstanding_limit() {
    let (mut seq, mut state) = setup(SequencerConfig {
        max_outstanding_requests: 2,
        async_pisc_limit: 2,
        ..SequencerConfig::default()
    });
    assert_eq!(RequestStatus::Issued, load(&mut seq, &mut state, 0, 0x5000, 0).0);
    assert_eq!(RequestStatus::Issued, load(&mut seq, &mut state, 0, 0x6000, 0).0);
    assert_eq!(RequestStatus::BufferFull, load(&mut seq, &mut state, 0, 0x7000, 0).0);
    // configuration stores never need a table entry
    assert_eq!(RequestStatus::Satisfied, store(&mut seq, &mut state, RegId::NumOutEdges, 9));
}

#[test]
fn stuck_request_reports_deadlock() {
    let (mut seq, mut state) = setup(SequencerConfig {
        deadlock_threshold: 100,
        ..SequencerConfig::default()
    });
    load(&mut seq, &mut state, 0, 0x5000, 0);
    assert_eq!(Some(100), seq.deadlock_check_at());
    seq.tick(&mut state, 99).unwrap();

    match seq.wakeup(100) {
        Err(SequencerError::Deadlock {
            kind,
            paddr,
            waited,
            reads,
            ..
        }) => {
            assert_eq!(RequestKind::Ld, kind);
            assert_eq!(0x5000, paddr);
            assert_eq!(100, waited);
            assert_eq!(1, reads);
        }
        other => panic!("expected deadlock, got {:?}", other),
    }
    let err = seq.tick(&mut state, 100).unwrap_err();
    assert!(err.to_string().contains("possible deadlock"));
}

#[test]
fn completed_requests_never_trip_deadlock_check() {
    let (mut seq, mut state) = setup(SequencerConfig {
        deadlock_threshold: 100,
        ..SequencerConfig::default()
    });
    load(&mut seq, &mut state, 0, 0x5000, 0);
    let msg = seq.take_outbox().remove(0);
    seq.callback(&mut state, msg, 10).unwrap();
    seq.tick(&mut state, 100).unwrap();
    assert_eq!(None, seq.deadlock_check_at());
    seq.tick(&mut state, 1_000).unwrap();
}

#[test]
fn readable_registers_answer_loads() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    let (status, req) = load(&mut seq, &mut state, 0, RegId::NumMappedVertices.addr(), 0);
    assert_eq!(RequestStatus::Satisfied, status);
    assert_eq!(4 * 64, req.value_u64());
    let (_, req) = load(&mut seq, &mut state, 0, RegId::OutstandingPiscOps.addr(), 0);
    assert_eq!(0, req.value_u64());
    assert_eq!(2, seq.stats().mmio_reads);
}

fn program_atomic(seq: &mut Sequencer, state: &mut EngineState) {
    map_range1(seq, state);
    store(seq, state, RegId::AtomicOpcode(0), b'd' as u64);
    store(seq, state, RegId::EnableAtomic, 1);
    store(seq, state, RegId::SrcInfo, 5);
}

#[test]
fn async_atomic_returns_at_admission() {
    let config = SequencerConfig::default();
    let base = config.pseudo_addr_base;
    let (mut seq, mut state) = setup(config);
    program_atomic(&mut seq, &mut state);

    assert_eq!(RequestStatus::Satisfied, store(&mut seq, &mut state, RegId::DestInfo, 20));
    assert_eq!(1, state.outstanding_pisc);
    assert_eq!(1, seq.local_pisc_ops());

    let msg = seq.take_outbox().remove(0);
    assert_eq!(RequestKind::StVertexRemote, msg.kind);
    assert!(msg.line_addr >= base);
    assert_eq!((1, 4), (msg.request.dest_core, msg.request.set));

    seq.callback(&mut state, msg, 4).unwrap();
    assert_eq!(0, state.outstanding_pisc);
    assert_eq!(0, seq.local_pisc_ops());
    assert!(seq.take_completions().is_empty());
    assert_eq!(0, seq.outstanding());
}

#[test]
fn synchronous_atomic_completes_to_core() {
    let (mut seq, mut state) = setup(SequencerConfig {
        async_pisc: false,
        ..SequencerConfig::default()
    });
    program_atomic(&mut seq, &mut state);

    assert_eq!(RequestStatus::Issued, store(&mut seq, &mut state, RegId::DestInfo, 3));
    let msg = seq.take_outbox().remove(0);
    assert_eq!(RequestKind::StVertexLocal, msg.kind);
    // local atomics pay the opcode latency
    assert_eq!(1, msg.latency);
    assert_eq!(1, state.outstanding_pisc);

    seq.callback(&mut state, msg, 6).unwrap();
    assert_eq!(0, state.outstanding_pisc);
    assert_eq!(1, seq.take_completions().len());
}

#[test]
fn dest_info_without_atomic_mode_is_a_plain_store() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    map_range1(&mut seq, &mut state);
    assert_eq!(RequestStatus::Issued, store(&mut seq, &mut state, RegId::DestInfo, 3));
    assert_eq!(RequestKind::St, seq.take_outbox()[0].kind);
    assert_eq!(0, state.outstanding_pisc);
}

#[test]
fn store_conditional_needs_matching_link() {
    let (mut seq, _) = setup(SequencerConfig::default());
    assert!(!seq.handle_llsc(0x40, RequestKind::StoreConditional, 0));
    assert!(seq.handle_llsc(0x40, RequestKind::LoadLinked, 0));
    assert!(!seq.handle_llsc(0x40, RequestKind::StoreConditional, 1));
    assert!(seq.handle_llsc(0x40, RequestKind::LoadLinked, 0));
    assert!(seq.handle_llsc(0x40, RequestKind::StoreConditional, 0));
    assert!(!seq.handle_llsc(0x40, RequestKind::StoreConditional, 0));

    // an intervening store by the holder drops the link
    seq.handle_llsc(0x80, RequestKind::LoadLinked, 2);
    seq.handle_llsc(0x80, RequestKind::St, 2);
    assert!(!seq.handle_llsc(0x80, RequestKind::StoreConditional, 2));
    assert_eq!(4, seq.stats().sc_failures);
}

#[test]
fn read_only_buffer_serves_repeat_vertex_loads() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    map_range1(&mut seq, &mut state);
    store(&mut seq, &mut state, RegId::EnableAtomic, 1);

    let (status, _) = load(&mut seq, &mut state, 0, 0x1008, 0);
    assert_eq!(RequestStatus::Issued, status);
    let mut msg = seq.take_outbox().remove(0);
    assert_eq!(RequestKind::LdVertexLocal, msg.kind);
    msg.request.set_response(&42u64.to_le_bytes());
    seq.callback(&mut state, msg, 2).unwrap();

    let (status, req) = load(&mut seq, &mut state, 0, 0x1008, 3);
    assert_eq!(RequestStatus::Satisfied, status);
    assert_eq!(42, req.value_u64());
    assert_eq!(1, seq.stats().readonly_hits);

    store(&mut seq, &mut state, RegId::EnableAtomic, 0);
    assert_eq!(RequestStatus::Issued, load(&mut seq, &mut state, 0, 0x1008, 4).0);
}

#[test]
fn flush_drops_the_issuing_context_read_only_values() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    map_range1(&mut seq, &mut state);
    store(&mut seq, &mut state, RegId::EnableAtomic, 1);

    load(&mut seq, &mut state, 0, 0x1008, 0);
    let mut msg = seq.take_outbox().remove(0);
    msg.request.set_response(&42u64.to_le_bytes());
    seq.callback(&mut state, msg, 2).unwrap();
    assert_eq!(RequestStatus::Satisfied, load(&mut seq, &mut state, 0, 0x1008, 3).0);

    let mut flush = RequestDescriptor::flush(0, 0x1008);
    assert_eq!(RequestStatus::Issued, seq.make_request(&mut state, &mut flush, 4).unwrap());
    assert!(!state.readonly.is_valid(0));
    let msg = seq.take_outbox().remove(0);
    assert_eq!(RequestKind::Flush, msg.kind);
    seq.callback(&mut state, msg, 5).unwrap();

    let (status, _) = load(&mut seq, &mut state, 0, 0x1008, 6);
    assert_eq!(RequestStatus::Issued, status);
    assert_eq!(1, seq.stats().readonly_hits);
}

#[test]
fn disabling_range3_shadows_frontier_and_flips_parity() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    map_range1(&mut seq, &mut state);
    store(&mut seq, &mut state, RegId::VertexStart(2), 0x8000);
    store(&mut seq, &mut state, RegId::Stride(2), 1);
    store(&mut seq, &mut state, RegId::EnableTracked(2), 1);
    assert_eq!(4, state.map.slot_for(RangeId::R3));

    store(&mut seq, &mut state, RegId::EnableTracked(2), 0);
    assert!(state.map.range(RangeId::R3Old).enabled);
    assert_eq!(0x8000, state.map.range(RangeId::R3Old).base);
    assert_eq!(1, state.map.iteration());
    assert_eq!(5, state.map.slot_for(RangeId::R3));

    // betweenness centrality keeps no previous frontier
    store(&mut seq, &mut state, RegId::AtomicOpcode(0), b'4' as u64);
    store(&mut seq, &mut state, RegId::EnableTracked(2), 1);
    store(&mut seq, &mut state, RegId::EnableTracked(2), 0);
    assert_eq!(1, state.map.iteration());
}

#[test]
fn dense_frontier_accesses_become_active_checks() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    map_range1(&mut seq, &mut state);
    store(&mut seq, &mut state, RegId::VertexStart(2), 0x8000);
    store(&mut seq, &mut state, RegId::Stride(2), 1);
    store(&mut seq, &mut state, RegId::EnableTracked(2), 1);
    store(&mut seq, &mut state, RegId::IsCopy, 1);

    let (status, _) = load(&mut seq, &mut state, 0, 0x8000 + 17, 0);
    assert_eq!(RequestStatus::Issued, status);
    let mut req = RequestDescriptor::write(0, 0x8000 + 5, &[1]);
    assert_eq!(RequestStatus::Issued, seq.make_request(&mut state, &mut req, 0).unwrap());

    let issued = seq.take_outbox();
    assert_eq!(RequestKind::CheckActiveVertexRemote, issued[0].kind);
    assert_eq!((1, 1, 4), (issued[0].request.dest_core, issued[0].request.set, issued[0].request.slot));
    assert_eq!(RequestKind::CheckActiveVertexLocal, issued[1].kind);
    assert!(!issued[0].request.is_copy);
    assert!(issued[1].request.is_copy);
}

#[test]
fn copy_mode_check_reissues_as_active_list_write() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    map_range1(&mut seq, &mut state);
    store(&mut seq, &mut state, RegId::VertexStart(2), 0x8000);
    store(&mut seq, &mut state, RegId::Stride(2), 1);
    store(&mut seq, &mut state, RegId::EnableTracked(2), 1);
    store(&mut seq, &mut state, RegId::IsCopy, 1);

    let mut req = RequestDescriptor::write(0, 0x8000 + 2, &[1]);
    seq.make_request(&mut state, &mut req, 0).unwrap();
    let check = seq.take_outbox().remove(0);
    seq.callback(&mut state, check, 2).unwrap();

    assert!(seq.take_completions().is_empty());
    let write = seq.take_outbox().remove(0);
    assert_eq!(RequestKind::St, write.kind);
    assert!(write.request.active_list_handled);
    assert_eq!(0x8000 + 2, write.request.vaddr);
    assert_eq!(1, seq.outstanding());

    seq.callback(&mut state, write, 3).unwrap();
    assert_eq!(1, seq.take_completions().len());
    assert_eq!(0, seq.outstanding());
}

#[test]
fn parked_active_list_write_trips_deadlock_check() {
    let (mut seq, mut state) = setup(SequencerConfig {
        deadlock_threshold: 100,
        ..SequencerConfig::default()
    });
    map_range1(&mut seq, &mut state);
    store(&mut seq, &mut state, RegId::VertexStart(2), 0x8000);
    store(&mut seq, &mut state, RegId::Stride(2), 1);
    store(&mut seq, &mut state, RegId::EnableTracked(2), 1);
    store(&mut seq, &mut state, RegId::IsCopy, 1);

    let mut req = RequestDescriptor::write(0, 0x8000 + 2, &[1]);
    seq.make_request(&mut state, &mut req, 0).unwrap();
    let check = seq.take_outbox().remove(0);

    // a check on vertex 0 holds the line the reissued write needs
    let (status, _) = load(&mut seq, &mut state, 0, 0x8000, 50);
    assert_eq!(RequestStatus::Issued, status);
    seq.take_outbox();
    seq.callback(&mut state, check, 2).unwrap();
    assert!(seq.take_outbox().is_empty());
    assert_eq!(2, seq.outstanding());
    assert_eq!(1, seq.stats().active_list_retries);

    seq.wakeup(101).unwrap();
    match seq.wakeup(102) {
        Err(SequencerError::Deadlock {
            kind, vaddr, issued_at, waited, ..
        }) => {
            assert_eq!(RequestKind::St, kind);
            assert_eq!(0x8000 + 2, vaddr);
            assert_eq!((2, 100), (issued_at, waited));
        }
        other => panic!("expected deadlock, got {:?}", other),
    }
}

#[test]
fn edge_prefetch_becomes_a_protocol_request() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    assert_eq!(RequestStatus::Satisfied, store(&mut seq, &mut state, RegId::PrefetchSize, 64));
    store(&mut seq, &mut state, RegId::EnablePrefetch, 1);
    store(&mut seq, &mut state, RegId::PrefetchAddr, 0x4010);
    assert_eq!(RequestStatus::Issued, store(&mut seq, &mut state, RegId::PrefetchSize, 64));

    let msg = seq.take_outbox().remove(0);
    assert_eq!(RequestKind::PrefetchEdge, msg.kind);
    assert_eq!((0x4000, 4), (msg.request.prefetch_base, msg.request.prefetch_lines));
}

#[test]
fn profile_registers_drive_windows() {
    let (mut seq, mut state) = setup(SequencerConfig::default());
    store(&mut seq, &mut state, RegId::ProfileStart, 1);
    load(&mut seq, &mut state, 0, RegId::NumMappedVertices.addr(), 0);
    store(&mut seq, &mut state, RegId::ProfileStop, 1);
    assert_eq!(RequestStatus::Satisfied, store(&mut seq, &mut state, RegId::ProfileDump, 1));

    let mut bad = RequestDescriptor::write_u64(0, RegId::ProfileStop.addr(), 1);
    assert!(seq.make_request(&mut state, &mut bad, 0).is_err());
    let mut bad = RequestDescriptor::write_u64(0, RegId::ProfileStart.addr(), 12);
    assert!(seq.make_request(&mut state, &mut bad, 0).is_err());
}

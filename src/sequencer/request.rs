use serde::Serialize;
use smallvec::SmallVec;

use crate::spm::atomic::{AtomicOperands, Opcode};
use crate::timeq::Cycle;

/// Protocol request types a sequencer hands to the controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestKind {
    Ld,
    St,
    IFetch,
    RmwRead,
    RmwWrite,
    LoadLinked,
    StoreConditional,
    LockedRmwRead,
    LockedRmwWrite,
    LdVertexLocal,
    LdVertexRemote,
    StVertexLocal,
    StVertexRemote,
    LockedVertexReadLocal,
    LockedVertexReadRemote,
    LockedVertexWriteLocal,
    LockedVertexWriteRemote,
    CheckActiveVertexLocal,
    CheckActiveVertexRemote,
    PrefetchEdge,
    Flush,
}

impl RequestKind {
    /// Served by a scratchpad controller rather than the backing memory.
    pub fn is_vertex(self) -> bool {
        use RequestKind::*;
        matches!(
            self,
            StVertexLocal
                | StVertexRemote
                | LockedVertexReadLocal
                | LockedVertexReadRemote
                | LockedVertexWriteLocal
                | LockedVertexWriteRemote
                | PrefetchEdge
                | CheckActiveVertexLocal
                | CheckActiveVertexRemote
                | LdVertexLocal
                | LdVertexRemote
        )
    }

    /// Vertex kinds other than edge prefetch are serviced at the destination scratchpad.
    pub fn served_by_scratchpad(self) -> bool {
        self.is_vertex() && self != RequestKind::PrefetchEdge
    }

    /// Kinds admitted through the write table.
    pub fn is_write_class(self) -> bool {
        use RequestKind::*;
        matches!(
            self,
            St | StVertexLocal
                | StVertexRemote
                | RmwRead
                | RmwWrite
                | LoadLinked
                | StoreConditional
                | LockedRmwRead
                | LockedVertexReadLocal
                | LockedVertexReadRemote
                | LockedRmwWrite
                | LockedVertexWriteLocal
                | LockedVertexWriteRemote
                | PrefetchEdge
                | CheckActiveVertexLocal
                | CheckActiveVertexRemote
                | Flush
        )
    }

    pub fn is_check_active(self) -> bool {
        matches!(
            self,
            RequestKind::CheckActiveVertexLocal | RequestKind::CheckActiveVertexRemote
        )
    }

    pub fn is_vertex_load(self) -> bool {
        use RequestKind::*;
        matches!(
            self,
            LdVertexLocal | LdVertexRemote | LockedVertexReadLocal | LockedVertexReadRemote
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemCmd {
    Read,
    Write,
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestStatus {
    Issued,
    Satisfied,
    Ready,
    Aliased,
    BufferFull,
}

/// One in-flight access, from the issuing core through admission and servicing.
#[derive(Debug, Clone, Serialize)]
pub struct RequestDescriptor {
    pub vaddr: u64,
    pub paddr: u64,
    pub size: usize,
    pub cmd: MemCmd,
    pub context: usize,
    pub data: SmallVec<[u8; 8]>,
    pub inst_fetch: bool,
    pub llsc: bool,
    pub locked_rmw: bool,
    pub store_check: bool,
    pub atomic: Option<(Opcode, AtomicOperands)>,
    pub is_atomic: bool,
    pub sparse: bool,
    pub dedup: bool,
    pub is_copy: bool,
    pub local: bool,
    pub dest_core: usize,
    pub set: u64,
    pub slot: usize,
    pub edge_vaddr: u64,
    pub active_list_handled: bool,
    pub num_tracked_atomic: u64,
    pub prefetch_base: u64,
    pub prefetch_lines: u64,
    /// 1 for a successful store-conditional, 0 for a failed one.
    pub extra_data: u64,
}

impl RequestDescriptor {
    fn new(cmd: MemCmd, context: usize, vaddr: u64, size: usize) -> Self {
        Self {
            vaddr,
            paddr: vaddr,
            size,
            cmd,
            context,
            data: SmallVec::from_elem(0, size),
            inst_fetch: false,
            llsc: false,
            locked_rmw: false,
            store_check: false,
            atomic: None,
            is_atomic: false,
            sparse: false,
            dedup: false,
            is_copy: false,
            local: false,
            dest_core: 0,
            set: 0,
            slot: 0,
            edge_vaddr: 0,
            active_list_handled: false,
            num_tracked_atomic: 0,
            prefetch_base: 0,
            prefetch_lines: 0,
            extra_data: 0,
        }
    }

    pub fn read(context: usize, vaddr: u64, size: usize) -> Self {
        Self::new(MemCmd::Read, context, vaddr, size)
    }

    pub fn write(context: usize, vaddr: u64, bytes: &[u8]) -> Self {
        let mut req = Self::new(MemCmd::Write, context, vaddr, bytes.len());
        req.data = SmallVec::from_slice(bytes);
        req
    }

    pub fn write_u64(context: usize, vaddr: u64, value: u64) -> Self {
        Self::write(context, vaddr, &value.to_le_bytes())
    }

    pub fn flush(context: usize, vaddr: u64) -> Self {
        Self::new(MemCmd::Flush, context, vaddr, 0)
    }

    pub fn is_read(&self) -> bool {
        self.cmd == MemCmd::Read
    }

    pub fn is_write(&self) -> bool {
        self.cmd == MemCmd::Write
    }

    /// Register value carried by a configuration write, zero-extended.
    pub fn value_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        let n = self.data.len().min(8);
        bytes[..n].copy_from_slice(&self.data[..n]);
        u64::from_le_bytes(bytes)
    }

    /// Fill the response payload with the little-endian bytes of `value`, truncated to `size`.
    pub fn set_response(&mut self, value: &[u8]) {
        self.data.clear();
        self.data.extend((0..self.size).map(|i| value.get(i).copied().unwrap_or(0)));
    }
}

/// Entry in an outstanding-request table.
#[derive(Debug, Clone)]
pub struct SequencerRequest {
    pub request: RequestDescriptor,
    pub kind: RequestKind,
    pub issued_at: Cycle,
}

#[cfg(test)]
mod tests {
    use super::{RequestDescriptor, RequestKind};

    #[test]
    fn classes_of_request_kinds() {
        assert!(RequestKind::CheckActiveVertexLocal.is_write_class());
        assert!(!RequestKind::LdVertexRemote.is_write_class());
        assert!(RequestKind::RmwRead.is_write_class());
        assert!(RequestKind::PrefetchEdge.is_vertex());
        assert!(!RequestKind::PrefetchEdge.served_by_scratchpad());
        assert!(!RequestKind::St.is_vertex());
    }

    #[test]
    fn register_values_are_zero_extended() {
        let req = RequestDescriptor::write(0, 0x300100, &[0x34, 0x12]);
        assert_eq!(0x1234, req.value_u64());
        let mut read = RequestDescriptor::read(1, 0x300148, 4);
        read.set_response(&0x0102_0304_0506u64.to_le_bytes());
        assert_eq!(&[0x06, 0x05, 0x04, 0x03], read.data.as_slice());
    }
}

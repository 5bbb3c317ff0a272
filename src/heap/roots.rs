use std::fmt;

/// Root categories, in the order the VM numbers them
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RootKind {
    ClassLoader = 0,
    Class = 1,
    StaticField = 2,
    LocalVariable = 3,
    VmInternalThreadData = 4,
    CodeBlob = 5,
    JniLocal = 6,
    JniGlobal = 7,
    ClassLoaderInternal = 8,
    Universe = 9,
    SystemDictionary = 10,
    BusyMonitor = 11,
    InternedString = 12,
    FlatProfiler = 13,
    Management = 14,
    Jvmti = 15,
    Debug = 16,
}

impl RootKind {
    pub const ALL: [RootKind; 17] = [
        RootKind::ClassLoader,
        RootKind::Class,
        RootKind::StaticField,
        RootKind::LocalVariable,
        RootKind::VmInternalThreadData,
        RootKind::CodeBlob,
        RootKind::JniLocal,
        RootKind::JniGlobal,
        RootKind::ClassLoaderInternal,
        RootKind::Universe,
        RootKind::SystemDictionary,
        RootKind::BusyMonitor,
        RootKind::InternedString,
        RootKind::FlatProfiler,
        RootKind::Management,
        RootKind::Jvmti,
        RootKind::Debug,
    ];

    pub fn from_u8(v: u8) -> Option<RootKind> {
        RootKind::ALL.get(v as usize).copied()
    }

    /// Administrative roots that carry no payload
    pub fn is_administrative(self) -> bool {
        (RootKind::ClassLoaderInternal as u8..=RootKind::Jvmti as u8).contains(&(self as u8))
    }

    pub fn name(self) -> &'static str {
        match self {
            RootKind::ClassLoader => "CLASS_LOADER_ROOT",
            RootKind::Class => "CLASS_ROOT",
            RootKind::StaticField => "STATIC_FIELD_ROOT",
            RootKind::LocalVariable => "LOCAL_VARIABLE_ROOT",
            RootKind::VmInternalThreadData => "VM_INTERNAL_THREAD_DATA_ROOT",
            RootKind::CodeBlob => "CODE_BLOB_ROOT",
            RootKind::JniLocal => "JNI_LOCAL_ROOT",
            RootKind::JniGlobal => "JNI_GLOBAL_ROOT",
            RootKind::ClassLoaderInternal => "CLASS_LOADER_INTERNAL",
            RootKind::Universe => "UNIVERSE",
            RootKind::SystemDictionary => "SYSTEM_DICTIONARY",
            RootKind::BusyMonitor => "BUSY_MONITOR",
            RootKind::InternedString => "INTERNED_STRING",
            RootKind::FlatProfiler => "FLAT_PROFILER",
            RootKind::Management => "MANAGEMENT",
            RootKind::Jvmti => "JVMTI",
            RootKind::Debug => "DEBUG_ROOT",
        }
    }
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A reference into the heap from outside it. Each variant carries only
/// what identifies that kind of root.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootPtr {
    ClassLoader {
        name: String,
    },
    Class {
        class_id: u32,
    },
    StaticField {
        class_id: u32,
        offset: u32,
    },
    LocalVariable {
        thread: u64,
        class_id: u32,
        method_id: u32,
        slot: u32,
    },
    VmInternalThreadData {
        thread: u64,
    },
    CodeBlob {
        class_id: u32,
        method_id: u32,
    },
    JniLocal {
        thread: u64,
    },
    JniGlobal {
        weak: bool,
    },
    /// One of the administrative kinds (`ClassLoaderInternal..=Jvmti`)
    Other(RootKind),
    Debug {
        vm_call: String,
    },
}

impl RootPtr {
    pub fn kind(&self) -> RootKind {
        match self {
            RootPtr::ClassLoader { .. } => RootKind::ClassLoader,
            RootPtr::Class { .. } => RootKind::Class,
            RootPtr::StaticField { .. } => RootKind::StaticField,
            RootPtr::LocalVariable { .. } => RootKind::LocalVariable,
            RootPtr::VmInternalThreadData { .. } => RootKind::VmInternalThreadData,
            RootPtr::CodeBlob { .. } => RootKind::CodeBlob,
            RootPtr::JniLocal { .. } => RootKind::JniLocal,
            RootPtr::JniGlobal { .. } => RootKind::JniGlobal,
            RootPtr::Other(kind) => *kind,
            RootPtr::Debug { .. } => RootKind::Debug,
        }
    }

    /// Build an administrative root, rejecting kinds that need a payload
    pub fn administrative(kind: RootKind) -> Option<RootPtr> {
        if kind.is_administrative() {
            Some(RootPtr::Other(kind))
        } else {
            None
        }
    }
}

impl fmt::Display for RootPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootPtr::ClassLoader { name } => write!(f, "{} {}", self.kind(), name),
            RootPtr::Class { class_id } => write!(f, "{} class={}", self.kind(), class_id),
            RootPtr::StaticField { class_id, offset } => {
                write!(f, "{} class={} offset={}", self.kind(), class_id, offset)
            }
            RootPtr::LocalVariable {
                thread,
                class_id,
                method_id,
                slot,
            } => write!(
                f,
                "{} thread={} class={} method={} slot={}",
                self.kind(),
                thread,
                class_id,
                method_id,
                slot
            ),
            RootPtr::VmInternalThreadData { thread } | RootPtr::JniLocal { thread } => {
                write!(f, "{} thread={}", self.kind(), thread)
            }
            RootPtr::CodeBlob {
                class_id,
                method_id,
            } => write!(f, "{} class={} method={}", self.kind(), class_id, method_id),
            RootPtr::JniGlobal { weak } => {
                write!(f, "{}{}", self.kind(), if *weak { " (weak)" } else { "" })
            }
            RootPtr::Other(kind) => write!(f, "{}", kind),
            RootPtr::Debug { vm_call } => write!(f, "{} {}", self.kind(), vm_call),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_numbering() {
        for (i, kind) in RootKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, i);
            assert_eq!(RootKind::from_u8(i as u8), Some(*kind));
        }
        assert_eq!(RootKind::from_u8(17), None);
    }

    #[test]
    fn test_administrative() {
        assert!(RootPtr::administrative(RootKind::Universe).is_some());
        assert!(RootPtr::administrative(RootKind::StaticField).is_none());
        assert!(RootPtr::administrative(RootKind::Debug).is_none());
    }

    #[test]
    fn test_display() {
        let root = RootPtr::StaticField {
            class_id: 3,
            offset: 16,
        };
        assert_eq!(root.kind(), RootKind::StaticField);
        assert_eq!(root.to_string(), "STATIC_FIELD_ROOT class=3 offset=16");
        assert_eq!(
            RootPtr::JniGlobal { weak: true }.to_string(),
            "JNI_GLOBAL_ROOT (weak)"
        );
    }
}

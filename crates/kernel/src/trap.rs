//! Saved user register state and the page-fault record.

use core::fmt;

use crate::memlayout::UXSTACKTOP;

/// Defines a named set of trap vectors.
#[macro_export]
macro_rules! trap_vectors {
    (
        $storage: ty,
        $(
            $name:ident = $value:expr,
        )*
    ) => {
        /// Represents a trap vector.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct TrapVector($storage);

        impl TrapVector {
            $(
                pub const $name: Self = Self($value);
            )*

            /// Creates a new trap vector from a raw value.
            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            /// Returns the raw value of the trap vector.
            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the trap vector, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Debug for TrapVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "TrapVector::{}({})", name, self.0)
                } else {
                    write!(f, "TrapVector({})", self.0)
                }
            }
        }

        impl core::fmt::Display for TrapVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(name) = self.name() {
                    write!(f, "{}", name)
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    }
}

trap_vectors!(
    u32,
    PAGE_FAULT = 14,
    TIMER = 32,
    NETWORK = 43,
    SYSCALL = 48,
);

/// User code segment selector (GDT slot 3, privilege level 3).
pub const GD_UT: u32 = 0x18;
/// User data segment selector (GDT slot 4, privilege level 3).
pub const GD_UD: u32 = 0x20;
/// Requested privilege level of user mode.
pub const DPL_USER: u32 = 3;
/// Interrupt-enable flag in EFLAGS.
pub const FL_IF: u32 = 0x200;

/// General-purpose registers in `pusha` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Ignored stack pointer slot written by `pusha`.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl Registers {
    const WORDS: usize = 8;

    fn to_words(self) -> [u32; Self::WORDS] {
        [
            self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax,
        ]
    }

    fn from_words(w: &[u32]) -> Self {
        Self {
            edi: w[0],
            esi: w[1],
            ebp: w[2],
            oesp: w[3],
            ebx: w[4],
            edx: w[5],
            ecx: w[6],
            eax: w[7],
        }
    }
}

/// The saved user-mode state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame {
    pub regs: Registers,
    pub es: u32,
    pub ds: u32,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl TrapFrame {
    /// Size of the frame in user memory.
    pub const SIZE: usize = 17 * 4;

    /// Returns the frame a freshly created environment starts with.
    pub fn user(entry: u32, stack_top: u32) -> Self {
        Self {
            es: GD_UD | DPL_USER,
            ds: GD_UD | DPL_USER,
            ss: GD_UD | DPL_USER,
            cs: GD_UT | DPL_USER,
            eflags: FL_IF,
            eip: entry,
            esp: stack_top,
            ..Self::default()
        }
    }

    /// Returns the trap that last entered the kernel from this frame.
    pub fn vector(&self) -> TrapVector {
        TrapVector::new(self.trapno)
    }

    /// Returns whether this frame runs with user privilege.
    pub fn is_user(&self) -> bool {
        self.cs & DPL_USER == DPL_USER
    }

    /// Returns whether the stack pointer is on the user exception stack.
    pub fn on_exception_stack(&self) -> bool {
        self.esp < UXSTACKTOP && self.esp >= UXSTACKTOP - crate::memlayout::PGSIZE
    }

    /// Serializes the frame as little-endian words.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u32; 17];
        words[..Registers::WORDS].copy_from_slice(&self.regs.to_words());
        words[8..].copy_from_slice(&[
            self.es,
            self.ds,
            self.trapno,
            self.err,
            self.eip,
            self.cs,
            self.eflags,
            self.esp,
            self.ss,
        ]);
        words_to_bytes(&words)
    }

    /// Deserializes a frame written by [`TrapFrame::to_bytes`].
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let w: [u32; 17] = bytes_to_words(bytes);
        Self {
            regs: Registers::from_words(&w[..Registers::WORDS]),
            es: w[8],
            ds: w[9],
            trapno: w[10],
            err: w[11],
            eip: w[12],
            cs: w[13],
            eflags: w[14],
            esp: w[15],
            ss: w[16],
        }
    }
}

/// The record pushed on the user exception stack for a page fault upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultRecord {
    pub fault_va: u32,
    pub err: u32,
    pub regs: Registers,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl FaultRecord {
    /// Size of the record on the exception stack.
    pub const SIZE: usize = 13 * 4;

    /// Builds the record for a fault at `fault_va` taken with state `tf`.
    pub fn new(fault_va: u32, err: u32, tf: &TrapFrame) -> Self {
        Self {
            fault_va,
            err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        }
    }

    /// Serializes the record as little-endian words.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u32; 13];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..10].copy_from_slice(&self.regs.to_words());
        words[10] = self.eip;
        words[11] = self.eflags;
        words[12] = self.esp;
        words_to_bytes(&words)
    }

    /// Deserializes a record written by [`FaultRecord::to_bytes`].
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let w: [u32; 13] = bytes_to_words(bytes);
        Self {
            fault_va: w[0],
            err: w[1],
            regs: Registers::from_words(&w[2..10]),
            eip: w[10],
            eflags: w[11],
            esp: w[12],
        }
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "va {:08x} err {:03x} eip {:08x} esp {:08x}",
            self.fault_va, self.err, self.eip, self.esp
        )
    }
}

fn words_to_bytes<const W: usize, const B: usize>(words: &[u32; W]) -> [u8; B] {
    debug_assert_eq!(W * 4, B);
    let mut bytes = [0u8; B];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn bytes_to_words<const B: usize, const W: usize>(bytes: &[u8; B]) -> [u32; W] {
    debug_assert_eq!(W * 4, B);
    let mut words = [0u32; W];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

//! The interrupt descriptor table and its 256 dispatch stubs.
//!
//! Every vector funnels into [`crate::dispatch`] with a uniform
//! [`InterruptContext`]; exception vectors that push an error code carry
//! it along. A handler that sets `resume_at` in the context gets the
//! interrupted frame's instruction pointer rewritten before `iretq`
//! (used by the fault-intercepting copy fixup).

use spin::RwLock;
use x86_64::structures::idt::{
    InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode,
};

use crate::InterruptContext;

static IDT: spin::Lazy<RwLock<InterruptDescriptorTable>> =
    spin::Lazy::new(|| RwLock::new(InterruptDescriptorTable::new()));

/// The common entry point of all stubs.
fn enter_from_stub(vector: u8, frame: &mut InterruptStackFrame, error_code: Option<u64>) {
    let mut context = InterruptContext {
        vector,
        instruction_pointer: frame.instruction_pointer.as_u64(),
        stack_pointer: frame.stack_pointer.as_u64(),
        cpu_flags: frame.cpu_flags.bits(),
        error_code,
        from_user: frame.code_segment.0 & 0b11 == 0b11,
        resume_at: None,
    };

    crate::dispatch(&mut context);

    if let Some(target) = context.resume_at {
        // The frame argument aliases the hardware-pushed frame on the
        // interrupt stack; its first quadword is the saved RIP.
        unsafe {
            let saved_rip = frame as *mut InterruptStackFrame as *mut u64;
            saved_rip.write_volatile(target);
        }
    }
}

macro_rules! exception_stub {
    ($vector:literal) => {{
        extern "x86-interrupt" fn stub(mut frame: InterruptStackFrame) {
            enter_from_stub($vector, &mut frame, None);
        }
        stub
    }};
}

macro_rules! exception_stub_with_error {
    ($vector:literal) => {{
        extern "x86-interrupt" fn stub(mut frame: InterruptStackFrame, error_code: u64) {
            enter_from_stub($vector, &mut frame, Some(error_code));
        }
        stub
    }};
}

macro_rules! interrupt_stubs {
    ($idt:expr, $($vector:literal)*) => {
        $(
            {
                extern "x86-interrupt" fn stub(mut frame: InterruptStackFrame) {
                    enter_from_stub($vector, &mut frame, None);
                }
                $idt[$vector].set_handler_fn(stub);
            }
        )*
    };
}

extern "x86-interrupt" fn double_fault_stub(mut frame: InterruptStackFrame, error_code: u64) -> ! {
    enter_from_stub(8, &mut frame, Some(error_code));
    panic!("interrupts: double fault is unrecoverable");
}

extern "x86-interrupt" fn page_fault_stub(
    mut frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    enter_from_stub(14, &mut frame, Some(error_code.bits()));
}

extern "x86-interrupt" fn machine_check_stub(mut frame: InterruptStackFrame) -> ! {
    enter_from_stub(18, &mut frame, None);
    panic!("interrupts: machine check is unrecoverable");
}

/// Builds the full table of stubs. Called once; each CPU then [`load`]s
/// the same table.
pub fn init() {
    let mut idt = IDT.write();

    idt.divide_error.set_handler_fn(exception_stub!(0));
    idt.debug.set_handler_fn(exception_stub!(1));
    idt.non_maskable_interrupt.set_handler_fn(exception_stub!(2));
    idt.breakpoint.set_handler_fn(exception_stub!(3));
    idt.overflow.set_handler_fn(exception_stub!(4));
    idt.bound_range_exceeded.set_handler_fn(exception_stub!(5));
    idt.invalid_opcode.set_handler_fn(exception_stub!(6));
    idt.device_not_available.set_handler_fn(exception_stub!(7));
    idt.double_fault.set_handler_fn(double_fault_stub);
    // 9: coprocessor segment overrun, reserved since the 486.
    idt.invalid_tss.set_handler_fn(exception_stub_with_error!(10));
    idt.segment_not_present.set_handler_fn(exception_stub_with_error!(11));
    idt.stack_segment_fault.set_handler_fn(exception_stub_with_error!(12));
    idt.general_protection_fault.set_handler_fn(exception_stub_with_error!(13));
    idt.page_fault.set_handler_fn(page_fault_stub);
    // 15: reserved.
    idt.x87_floating_point.set_handler_fn(exception_stub!(16));
    idt.alignment_check.set_handler_fn(exception_stub_with_error!(17));
    idt.machine_check.set_handler_fn(machine_check_stub);
    idt.simd_floating_point.set_handler_fn(exception_stub!(19));
    idt.virtualization.set_handler_fn(exception_stub!(20));

    interrupt_stubs!(idt,
        32 33 34 35 36 37 38 39 40 41 42 43 44 45 46 47
        48 49 50 51 52 53 54 55 56 57 58 59 60 61 62 63
        64 65 66 67 68 69 70 71 72 73 74 75 76 77 78 79
        80 81 82 83 84 85 86 87 88 89 90 91 92 93 94 95
        96 97 98 99 100 101 102 103 104 105 106 107 108 109 110 111
        112 113 114 115 116 117 118 119 120 121 122 123 124 125 126 127
        128 129 130 131 132 133 134 135 136 137 138 139 140 141 142 143
        144 145 146 147 148 149 150 151 152 153 154 155 156 157 158 159
        160 161 162 163 164 165 166 167 168 169 170 171 172 173 174 175
        176 177 178 179 180 181 182 183 184 185 186 187 188 189 190 191
        192 193 194 195 196 197 198 199 200 201 202 203 204 205 206 207
        208 209 210 211 212 213 214 215 216 217 218 219 220 221 222 223
        224 225 226 227 228 229 230 231 232 233 234 235 236 237 238 239
        240 241 242 243 244 245 246 247 248 249 250 251 252 253 254 255
    );
}

/// Loads the table on the calling CPU.
pub fn load() {
    #[cfg(target_os = "none")]
    unsafe {
        IDT.read().load_unsafe();
    }
}

/// Opens the vector's gate to ring 3 (IDT descriptor privilege level).
pub fn make_user_callable(vector: u8) {
    assert!(vector >= 32, "idt: refusing ring-3 access to exception vector {:#X}", vector);

    let mut idt = IDT.write();
    let entry = &mut idt[vector];
    let handler_addr = entry.handler_addr().as_u64();
    assert!(handler_addr != 0, "idt: make_user_callable({:#X}) before init()", vector);

    // Re-install the same stub to reach the entry's options.
    let handler: x86_64::structures::idt::HandlerFunc =
        unsafe { core::mem::transmute(handler_addr) };
    entry
        .set_handler_fn(handler)
        .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
}

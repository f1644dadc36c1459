//! Lazy/non-lazy symbol pointer patching for Mach-O hosts.
//!
//! Every loaded image is walked through its load commands: the `__DATA`,
//! `__DATA_CONST` and `__AUTH_CONST` segments contribute the pointer
//! sections, the `__LINKEDIT` segment locates the symbol, string and
//! indirect-symbol tables. A slot whose indirect entry names a hooked symbol
//! is made writable with `vm_protect(RW|COPY)` and rewritten; `__AUTH_CONST`
//! is treated exactly like `__DATA_CONST`, relying on `VM_PROT_COPY` for an
//! unauthenticated writable mapping.

use std::collections::HashSet;
use std::ffi::CStr;
use std::sync::Mutex;

use libc::{c_char, c_int, c_uint, c_void};
use log::{debug, warn};
use recorder_errors::RecorderResult;

use super::{hooked_symbols, own_image_name, HookedSymbol};
use crate::logging::record_patch_skip;

const MH_MAGIC_64: u32 = 0xfeedfacf;
const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const SECTION_TYPE_MASK: u32 = 0x000000ff;
const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
const INDIRECT_SYMBOL_LOCAL: u32 = 0x80000000;
const INDIRECT_SYMBOL_ABS: u32 = 0x40000000;

const VM_PROT_READ: c_int = 0x1;
const VM_PROT_WRITE: c_int = 0x2;
const VM_PROT_COPY: c_int = 0x10;

#[repr(C)]
struct MachHeader64 {
    magic: u32,
    cputype: i32,
    cpusubtype: i32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    flags: u32,
    reserved: u32,
}

#[repr(C)]
struct LoadCommand {
    cmd: u32,
    cmdsize: u32,
}

#[repr(C)]
struct SegmentCommand64 {
    cmd: u32,
    cmdsize: u32,
    segname: [u8; 16],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: c_int,
    initprot: c_int,
    nsects: u32,
    flags: u32,
}

#[repr(C)]
struct Section64 {
    sectname: [u8; 16],
    segname: [u8; 16],
    addr: u64,
    size: u64,
    offset: u32,
    align: u32,
    reloff: u32,
    nreloc: u32,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
    reserved3: u32,
}

#[repr(C)]
struct SymtabCommand {
    cmd: u32,
    cmdsize: u32,
    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,
}

#[repr(C)]
struct DysymtabCommand {
    cmd: u32,
    cmdsize: u32,
    ilocalsym: u32,
    nlocalsym: u32,
    iextdefsym: u32,
    nextdefsym: u32,
    iundefsym: u32,
    nundefsym: u32,
    tocoff: u32,
    ntoc: u32,
    modtaboff: u32,
    nmodtab: u32,
    extrefsymoff: u32,
    nextrefsyms: u32,
    indirectsymoff: u32,
    nindirectsyms: u32,
    extreloff: u32,
    nextrel: u32,
    locreloff: u32,
    nlocrel: u32,
}

#[repr(C)]
struct Nlist64 {
    n_strx: u32,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    n_value: u64,
}

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const MachHeader64;
    fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
    fn _dyld_get_image_name(index: u32) -> *const c_char;
    fn mach_task_self() -> c_uint;
    fn vm_protect(
        task: c_uint,
        address: usize,
        size: usize,
        set_maximum: c_int,
        new_protection: c_int,
    ) -> c_int;
}

struct PatchEntry {
    image: String,
    symbol: String,
    slot: usize,
    previous: usize,
}

#[derive(Default)]
struct PatchState {
    patched_images: HashSet<String>,
    entries: Vec<PatchEntry>,
}

static STATE: Mutex<Option<PatchState>> = Mutex::new(None);

fn should_skip(image: &str, self_name: Option<&str>) -> bool {
    if image.contains("/usr/lib/dyld") || image.contains("libdyld") {
        return true;
    }
    matches!(self_name, Some(own) if image == own)
}

pub fn overwrite_symbols() -> RecorderResult<()> {
    let symbols = hooked_symbols();
    let self_name = own_image_name();
    let mut guard = STATE.lock().expect("patch state lock");
    let state = guard.get_or_insert_with(PatchState::default);

    let count = unsafe { _dyld_image_count() };
    for index in 0..count {
        let name_ptr = unsafe { _dyld_get_image_name(index) };
        if name_ptr.is_null() {
            continue;
        }
        let image = unsafe { CStr::from_ptr(name_ptr) }
            .to_string_lossy()
            .into_owned();
        if should_skip(&image, self_name.as_deref()) || state.patched_images.contains(&image) {
            continue;
        }
        let header = unsafe { _dyld_get_image_header(index) };
        let slide = unsafe { _dyld_get_image_vmaddr_slide(index) };
        if header.is_null() {
            continue;
        }
        unsafe { patch_one_image(state, &symbols, &image, header, slide) };
        state.patched_images.insert(image);
    }
    Ok(())
}

pub fn restore_symbols() {
    let Some(state) = STATE.lock().expect("patch state lock").take() else {
        return;
    };
    for entry in state.entries {
        let granted = unsafe {
            vm_protect(
                mach_task_self(),
                entry.slot,
                std::mem::size_of::<usize>(),
                0,
                VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
            )
        };
        if granted != 0 {
            warn!(
                "could not restore {} in {}: vm_protect failed",
                entry.symbol, entry.image
            );
            continue;
        }
        unsafe { std::ptr::write_volatile(entry.slot as *mut usize, entry.previous) };
    }
}

struct LinkTables {
    symtab: *const Nlist64,
    nsyms: u32,
    strtab: *const c_char,
    indirect: *const u32,
    nindirect: u32,
}

unsafe fn patch_one_image(
    state: &mut PatchState,
    symbols: &[HookedSymbol],
    image: &str,
    header: *const MachHeader64,
    slide: isize,
) {
    if (*header).magic != MH_MAGIC_64 {
        return;
    }
    let Some(tables) = read_link_tables(header, slide) else {
        return;
    };

    let mut command = (header as *const u8).add(std::mem::size_of::<MachHeader64>());
    for _ in 0..(*header).ncmds {
        let load = &*(command as *const LoadCommand);
        if load.cmd == LC_SEGMENT_64 {
            let segment = &*(command as *const SegmentCommand64);
            let segname = segment_name(&segment.segname);
            if matches!(segname, "__DATA" | "__DATA_CONST" | "__AUTH_CONST") {
                let sections = (command as *const u8).add(std::mem::size_of::<SegmentCommand64>())
                    as *const Section64;
                for section_index in 0..segment.nsects as usize {
                    patch_section(state, symbols, image, &tables, &*sections.add(section_index), slide);
                }
            }
        }
        command = command.add(load.cmdsize as usize);
    }
}

unsafe fn read_link_tables(header: *const MachHeader64, slide: isize) -> Option<LinkTables> {
    let mut linkedit: Option<&SegmentCommand64> = None;
    let mut symtab: Option<&SymtabCommand> = None;
    let mut dysymtab: Option<&DysymtabCommand> = None;

    let mut command = (header as *const u8).add(std::mem::size_of::<MachHeader64>());
    for _ in 0..(*header).ncmds {
        let load = &*(command as *const LoadCommand);
        match load.cmd {
            LC_SEGMENT_64 => {
                let segment = &*(command as *const SegmentCommand64);
                if segment_name(&segment.segname) == "__LINKEDIT" {
                    linkedit = Some(segment);
                }
            }
            LC_SYMTAB => symtab = Some(&*(command as *const SymtabCommand)),
            LC_DYSYMTAB => dysymtab = Some(&*(command as *const DysymtabCommand)),
            _ => {}
        }
        command = command.add(load.cmdsize as usize);
    }

    let linkedit = linkedit?;
    let symtab = symtab?;
    let dysymtab = dysymtab?;
    let linkedit_base =
        (slide as usize + linkedit.vmaddr as usize).wrapping_sub(linkedit.fileoff as usize);
    Some(LinkTables {
        symtab: (linkedit_base + symtab.symoff as usize) as *const Nlist64,
        nsyms: symtab.nsyms,
        strtab: (linkedit_base + symtab.stroff as usize) as *const c_char,
        indirect: (linkedit_base + dysymtab.indirectsymoff as usize) as *const u32,
        nindirect: dysymtab.nindirectsyms,
    })
}

unsafe fn patch_section(
    state: &mut PatchState,
    symbols: &[HookedSymbol],
    image: &str,
    tables: &LinkTables,
    section: &Section64,
    slide: isize,
) {
    let section_type = section.flags & SECTION_TYPE_MASK;
    if section_type != S_LAZY_SYMBOL_POINTERS && section_type != S_NON_LAZY_SYMBOL_POINTERS {
        return;
    }
    let slot_count = section.size as usize / std::mem::size_of::<usize>();
    let slots = (slide as usize + section.addr as usize) as *mut usize;
    for index in 0..slot_count {
        let indirect_index = section.reserved1 as usize + index;
        if indirect_index >= tables.nindirect as usize {
            break;
        }
        let symbol_index = *tables.indirect.add(indirect_index);
        if symbol_index & (INDIRECT_SYMBOL_ABS | INDIRECT_SYMBOL_LOCAL) != 0 {
            continue;
        }
        if symbol_index >= tables.nsyms {
            continue;
        }
        let nlist = &*tables.symtab.add(symbol_index as usize);
        // Mach-O symbol names carry a leading underscore.
        let name = CStr::from_ptr(tables.strtab.add(nlist.n_strx as usize));
        let Ok(name) = name.to_str() else { continue };
        let Some(stripped) = name.strip_prefix('_') else { continue };
        let Some(hook) = symbols
            .iter()
            .find(|candidate| candidate.name.to_bytes() == stripped.as_bytes())
        else {
            continue;
        };

        let slot = slots.add(index);
        let previous = std::ptr::read_volatile(slot);
        if previous == hook.shim {
            continue;
        }
        let granted = vm_protect(
            mach_task_self(),
            slot as usize,
            std::mem::size_of::<usize>(),
            0,
            VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
        );
        if granted != 0 {
            record_patch_skip("vm_protect_denied");
            warn!("slot for {} in {} is not writable", name, image);
            continue;
        }
        std::ptr::write_volatile(slot, hook.shim);
        debug!("patched {} in {}", name, image);
        state.entries.push(PatchEntry {
            image: image.to_string(),
            symbol: stripped.to_string(),
            slot: slot as usize,
            previous,
        });
    }
}

fn segment_name(raw: &[u8; 16]) -> &str {
    let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

/// dyld invokes this for images loaded after patching was enabled.
pub extern "C" fn add_image_callback(_header: *const c_void, _slide: isize) {
    crate::tracker::on_loader_change();
}

/// Register the add-image callback once per process.
pub fn register_add_image_callback() {
    extern "C" {
        fn _dyld_register_func_for_add_image(
            callback: extern "C" fn(*const c_void, isize),
        );
    }
    unsafe { _dyld_register_func_for_add_image(add_image_callback) };
}

//! GOT/PLT patching for ELF hosts.
//!
//! For every object reported by `dl_iterate_phdr` the dynamic section gives
//! the string and symbol tables plus the relocation tables. Any relocation
//! whose symbol matches a hooked name has its slot (`l_addr + r_offset`)
//! rewritten to point at the shim. Edits are remembered per
//! `(image, symbol)` so `restore_symbols` can invert them bit-exactly, and a
//! patched-image set keeps re-reported images from being patched twice.

use std::collections::HashSet;
use std::ffi::CStr;
use std::sync::Mutex;

use libc::{c_int, c_void, dl_phdr_info};
use log::{debug, warn};
use recorder_errors::RecorderResult;

use super::{hooked_symbols, own_image_name, HookedSymbol};
use crate::logging::record_patch_skip;

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;
const DT_GNU_HASH: i64 = 0x6ffffef5;

#[repr(C)]
struct Elf64Dyn {
    d_tag: i64,
    d_val: u64,
}

#[repr(C)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

/// Shared prefix of `Elf64_Rel` and `Elf64_Rela`; the addend is irrelevant
/// for slot patching, so both table kinds are read through this view.
#[repr(C)]
struct Elf64Reloc {
    r_offset: u64,
    r_info: u64,
}

const RELA_ENTRY_SIZE: usize = 24;
const REL_ENTRY_SIZE: usize = 16;

struct PatchEntry {
    image: String,
    symbol: String,
    slot: usize,
    previous: usize,
    was_writable: bool,
}

#[derive(Default)]
struct PatchState {
    patched_images: HashSet<String>,
    entries: Vec<PatchEntry>,
}

static STATE: Mutex<Option<PatchState>> = Mutex::new(None);

struct PatchContext {
    symbols: Vec<HookedSymbol>,
    self_name: Option<String>,
    already_patched: HashSet<String>,
    new_entries: Vec<PatchEntry>,
    newly_patched: Vec<String>,
}

/// Patch every currently loaded image. Idempotent: images already in the
/// patched set are skipped, so this doubles as the add-image callback when
/// `dlopen` brings in new objects.
pub fn overwrite_symbols() -> RecorderResult<()> {
    let already_patched = {
        let guard = STATE.lock().expect("patch state lock");
        guard
            .as_ref()
            .map(|state| state.patched_images.clone())
            .unwrap_or_default()
    };
    let mut context = PatchContext {
        symbols: hooked_symbols(),
        self_name: own_image_name(),
        already_patched,
        new_entries: Vec::new(),
        newly_patched: Vec::new(),
    };
    unsafe {
        libc::dl_iterate_phdr(
            Some(patch_image_callback),
            &mut context as *mut PatchContext as *mut c_void,
        );
    }
    debug!(
        "patched {} slot(s) across {} new image(s)",
        context.new_entries.len(),
        context.newly_patched.len()
    );

    let mut guard = STATE.lock().expect("patch state lock");
    let state = guard.get_or_insert_with(PatchState::default);
    state.entries.append(&mut context.new_entries);
    state
        .patched_images
        .extend(context.newly_patched.into_iter());
    Ok(())
}

/// Invert every remembered slot edit and clear the patched set. Entries for
/// images that have been unloaded since are dropped untouched.
pub fn restore_symbols() {
    let Some(state) = STATE.lock().expect("patch state lock").take() else {
        return;
    };
    let live_images = loaded_image_names();
    for entry in state.entries {
        if !live_images.contains(&entry.image) {
            debug!(
                "image {} vanished before restore; leaving {}",
                entry.image, entry.symbol
            );
            continue;
        }
        let result = unsafe {
            with_writable_slot(entry.slot, entry.was_writable, || unsafe {
                let slot = entry.slot as *mut usize;
                std::ptr::write_volatile(slot, entry.previous);
            })
        };
        if result.is_err() {
            warn!(
                "could not restore {} in {}: slot not writable",
                entry.symbol, entry.image
            );
        }
    }
}

#[cfg(test)]
pub(crate) fn patched_slot_count() -> usize {
    STATE
        .lock()
        .expect("patch state lock")
        .as_ref()
        .map(|state| state.entries.len())
        .unwrap_or(0)
}

fn loaded_image_names() -> HashSet<String> {
    unsafe extern "C" fn collect(
        info: *mut dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let names = &mut *(data as *mut HashSet<String>);
        names.insert(image_name(&*info));
        0
    }
    let mut names = HashSet::new();
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut names as *mut HashSet<String> as *mut c_void);
    }
    names
}

unsafe fn image_name(info: &dl_phdr_info) -> String {
    if info.dlpi_name.is_null() {
        return "<main>".to_string();
    }
    let name = CStr::from_ptr(info.dlpi_name).to_string_lossy();
    if name.is_empty() {
        "<main>".to_string()
    } else {
        name.into_owned()
    }
}

fn should_skip(image: &str, self_name: Option<&str>) -> bool {
    if image.contains("linux-vdso") || image.contains("/ld-linux") || image.contains("/ld.so") {
        return true;
    }
    matches!(self_name, Some(own) if image == own)
}

unsafe extern "C" fn patch_image_callback(
    info: *mut dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let context = &mut *(data as *mut PatchContext);
    let info = &*info;
    let image = image_name(info);
    if should_skip(&image, context.self_name.as_deref())
        || context.already_patched.contains(&image)
    {
        return 0;
    }
    patch_one_image(context, info, &image);
    context.newly_patched.push(image);
    0
}

/// Runtime view of one image's dynamic section.
struct DynamicInfo {
    strtab: usize,
    symtab: usize,
    rela: usize,
    rela_size: usize,
    rel: usize,
    rel_size: usize,
    jmprel: usize,
    jmprel_size: usize,
    jmprel_is_rela: bool,
    symbol_count: Option<usize>,
}

unsafe fn patch_one_image(context: &mut PatchContext, info: &dl_phdr_info, image: &str) {
    let base = info.dlpi_addr as usize;
    let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let Some(dynamic) = phdrs.iter().find(|phdr| phdr.p_type == libc::PT_DYNAMIC) else {
        return;
    };
    let Some(layout) = read_dynamic_section(base, (base + dynamic.p_vaddr as usize) as *const Elf64Dyn)
    else {
        return;
    };

    let mut patched_here = 0usize;
    let mut failed = false;
    let mut patch_table = |table: usize, size: usize, entry_len: usize| unsafe {
        if table == 0 || size == 0 {
            return;
        }
        for index in 0..size / entry_len {
            let reloc = &*((table + index * entry_len) as *const Elf64Reloc);
            let sym_index = (reloc.r_info >> 32) as usize;
            if sym_index == 0 {
                continue;
            }
            if let Some(count) = layout.symbol_count {
                if sym_index >= count {
                    continue;
                }
            }
            let sym = &*((layout.symtab + sym_index * std::mem::size_of::<Elf64Sym>())
                as *const Elf64Sym);
            let name = CStr::from_ptr((layout.strtab + sym.st_name as usize) as *const libc::c_char);
            let Some(hook) = context
                .symbols
                .iter()
                .find(|candidate| candidate.name == name)
            else {
                continue;
            };

            let slot_addr = base + reloc.r_offset as usize;
            let slot = slot_addr as *mut usize;
            let previous = std::ptr::read_volatile(slot);
            if previous == hook.shim {
                continue;
            }
            let was_writable = segment_is_writable(phdrs, reloc.r_offset as usize);
            let written = with_writable_slot(slot_addr, was_writable, || unsafe {
                std::ptr::write_volatile(slot, hook.shim);
            });
            match written {
                Ok(()) => {
                    context.new_entries.push(PatchEntry {
                        image: image.to_string(),
                        symbol: name.to_string_lossy().into_owned(),
                        slot: slot_addr,
                        previous,
                        was_writable,
                    });
                    patched_here += 1;
                }
                Err(()) => failed = true,
            }
        }
    };

    patch_table(layout.rela, layout.rela_size, RELA_ENTRY_SIZE);
    patch_table(layout.rel, layout.rel_size, REL_ENTRY_SIZE);
    let jmprel_entry = if layout.jmprel_is_rela {
        RELA_ENTRY_SIZE
    } else {
        REL_ENTRY_SIZE
    };
    patch_table(layout.jmprel, layout.jmprel_size, jmprel_entry);

    if failed {
        // Logged once per image; the library keeps its original slots.
        record_patch_skip("unwritable_got");
        warn!("some relocation slots in {} could not be patched", image);
    } else if patched_here > 0 {
        debug!("patched {} slot(s) in {}", patched_here, image);
    }
}

unsafe fn read_dynamic_section(base: usize, mut entry: *const Elf64Dyn) -> Option<DynamicInfo> {
    let mut layout = DynamicInfo {
        strtab: 0,
        symtab: 0,
        rela: 0,
        rela_size: 0,
        rel: 0,
        rel_size: 0,
        jmprel: 0,
        jmprel_size: 0,
        jmprel_is_rela: true,
        symbol_count: None,
    };
    // The loader relocates table addresses on most hosts; values below the
    // load bias are still file-relative and need it added back.
    let adjust = |value: u64| -> usize {
        let value = value as usize;
        if value < base {
            base + value
        } else {
            value
        }
    };
    loop {
        let current = &*entry;
        match current.d_tag {
            DT_NULL => break,
            DT_STRTAB => layout.strtab = adjust(current.d_val),
            DT_SYMTAB => layout.symtab = adjust(current.d_val),
            DT_RELA => layout.rela = adjust(current.d_val),
            DT_RELASZ => layout.rela_size = current.d_val as usize,
            DT_REL => layout.rel = adjust(current.d_val),
            DT_RELSZ => layout.rel_size = current.d_val as usize,
            DT_JMPREL => layout.jmprel = adjust(current.d_val),
            DT_PLTRELSZ => layout.jmprel_size = current.d_val as usize,
            DT_PLTREL => layout.jmprel_is_rela = current.d_val as i64 == DT_RELA,
            DT_HASH => {
                let table = adjust(current.d_val) as *const u32;
                layout.symbol_count = Some(*table.add(1) as usize);
            }
            DT_GNU_HASH => {
                if layout.symbol_count.is_none() {
                    layout.symbol_count = gnu_hash_symbol_count(adjust(current.d_val) as *const u32);
                }
            }
            _ => {}
        }
        entry = entry.add(1);
    }
    if layout.strtab == 0 || layout.symtab == 0 {
        return None;
    }
    Some(layout)
}

/// Recover the symbol count from a GNU hash table by walking every bucket's
/// chain to the highest terminated index.
unsafe fn gnu_hash_symbol_count(table: *const u32) -> Option<usize> {
    let nbuckets = *table as usize;
    let symoffset = *table.add(1) as usize;
    let bloom_size = *table.add(2) as usize;
    if nbuckets == 0 {
        return Some(symoffset);
    }
    let buckets = (table.add(4) as *const u8).add(bloom_size * 8) as *const u32;
    let chains = buckets.add(nbuckets);
    let mut max_index = 0usize;
    for bucket in 0..nbuckets {
        let mut index = *buckets.add(bucket) as usize;
        if index < symoffset {
            continue;
        }
        loop {
            if index > max_index {
                max_index = index;
            }
            let chain_value = *chains.add(index - symoffset);
            if chain_value & 1 == 1 {
                break;
            }
            index += 1;
        }
    }
    Some(max_index + 1)
}

fn segment_is_writable(phdrs: &[libc::Elf64_Phdr], offset: usize) -> bool {
    const PF_W: u32 = 2;
    phdrs.iter().any(|phdr| {
        phdr.p_type == libc::PT_LOAD
            && offset >= phdr.p_vaddr as usize
            && offset < (phdr.p_vaddr + phdr.p_memsz) as usize
            && phdr.p_flags & PF_W != 0
    })
}

/// Run `write` with the slot's page writable, restoring read-only protection
/// afterwards when the segment was not writable to begin with.
unsafe fn with_writable_slot(slot: usize, was_writable: bool, write: impl FnOnce()) -> Result<(), ()> {
    if was_writable {
        write();
        return Ok(());
    }
    let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let page = (slot & !(page_size - 1)) as *mut c_void;
    if libc::mprotect(page, page_size, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        return Err(());
    }
    write();
    libc::mprotect(page, page_size, libc::PROT_READ);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Patching runs against the live test process: the test binary and its
    // libraries get their slots rewritten while the tracker stays inactive,
    // so every shim passes straight through to libc.
    #[test]
    fn overwrite_then_restore_round_trips_live_images() {
        let _lock = crate::tracker::GLOBAL_TEST_LOCK.lock().expect("test lock");
        overwrite_symbols().expect("patch");
        let patched = patched_slot_count();

        // Second pass is a no-op thanks to the patched-image set.
        overwrite_symbols().expect("repatch");
        assert_eq!(patched_slot_count(), patched);

        // Allocations keep working while patched.
        let probe: Vec<u8> = vec![0xAB; 4096];
        assert_eq!(probe.len(), 4096);
        drop(probe);

        restore_symbols();
        assert_eq!(patched_slot_count(), 0);

        // And a fresh patch starts from an empty set again.
        overwrite_symbols().expect("patch again");
        restore_symbols();
    }

    #[test]
    fn loader_and_vdso_images_are_skipped() {
        assert!(should_skip("linux-vdso.so.1", None));
        assert!(should_skip("/lib64/ld-linux-x86-64.so.2", None));
        assert!(should_skip("/tmp/self.so", Some("/tmp/self.so")));
        assert!(!should_skip("/usr/lib/libssl.so.3", Some("/tmp/self.so")));
    }
}

//! The storage engine: cell heap, lookup and value tables, garbage collector.
//!
//! All data structures of the runtime are built from cells holding two
//! atoms. Since either atom can point to another cell, almost any shape can
//! be formed. The cell heap is managed by a tri-colour mark-and-sweep
//! collector; the boxed-value tables (strings, large numbers, decimals,
//! references, arrays) are reclaimed by reference counts that a major
//! collection recomputes from scratch.
//!
//! The symbol and globals tables never release entries. An atom carrying an
//! index into them stays valid for the lifetime of the storage.

pub mod array;
pub mod lookup_table;
pub mod reference;
pub mod value_table;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;

use crate::atom::{Atom, Tag, RESERVED_SYMBOLS};
use array::Array;
use lookup_table::LookupTable;
use reference::Reference;
use value_table::ValueTable;

/// One record of the cell heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub car: Atom,
    pub cdr: Atom,
}

/// Per-cell colour used by the garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// The cell is on the free list.
    Unused,
    /// Allocated since the last collection; may be freed by the next one.
    Gray,
    /// Known reachable, contents not scanned yet.
    Referenced,
    /// Known reachable, contents scanned.
    Checked,
}

/// Tuning parameters of the collector. The defaults match the recommended
/// values; embedders can override them through [`Storage::with_config`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Every n-th collection is promoted to a major one.
    pub max_minor_runs: u64,
    /// Minimum number of free cells required after a collection before the
    /// heap is grown.
    pub min_free_space: usize,
    /// Number of cells added when the heap is extended.
    pub chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            max_minor_runs: 10,
            min_free_space: 256,
            chunk_size: 4096,
        }
    }
}

/// Counters describing the current state of the storage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStatus {
    pub num_gc_roots: usize,
    pub num_symbols: usize,
    pub num_globals: usize,
    pub total_cells: usize,
    pub cells_used: usize,
    pub total_strings: usize,
    pub strings_used: usize,
    pub total_numbers: usize,
    pub numbers_used: usize,
    pub total_decimals: usize,
    pub decimals_used: usize,
    pub total_references: usize,
    pub references_used: usize,
    pub total_arrays: usize,
    pub arrays_used: usize,
}

/// Sliding average over the last ten collections, used for the
/// GC-efficiency statistic.
#[derive(Debug)]
struct SlidingAverage {
    probes: [f64; 10],
    index: usize,
    count: usize,
}

impl SlidingAverage {
    fn new() -> Self {
        SlidingAverage {
            probes: [0.0; 10],
            index: 0,
            count: 0,
        }
    }

    fn add(&mut self, value: f64) {
        self.probes[self.index] = value;
        self.index = (self.index + 1) % self.probes.len();
        if self.count < self.probes.len() {
            self.count += 1;
        }
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.probes[..self.count].iter().sum::<f64>() / self.count as f64
    }
}

/// The registered strong roots. Kept behind a shared handle so [`AtomRef`]s
/// can be created and dropped without borrowing the storage itself.
#[derive(Debug, Default)]
struct RootSet {
    slots: Vec<Atom>,
    free: Vec<usize>,
}

impl RootSet {
    fn register(&mut self, atom: Atom) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = atom;
                slot
            }
            None => {
                self.slots.push(atom);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = Atom::NIL;
        self.free.push(slot);
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// A strong reference to an atom: as long as the handle lives, the atom (and
/// everything reachable from it) survives garbage collection. All VM
/// registers and all compiler scratch variables are held this way, so a
/// collection in the middle of a nested allocation cannot pull the data out
/// from under them.
#[derive(Debug)]
pub struct AtomRef {
    slot: usize,
    roots: Rc<RefCell<RootSet>>,
}

impl AtomRef {
    pub fn atom(&self) -> Atom {
        self.roots.borrow().slots[self.slot]
    }

    pub fn set(&self, atom: Atom) {
        self.roots.borrow_mut().slots[self.slot] = atom;
    }
}

impl Drop for AtomRef {
    fn drop(&mut self) {
        self.roots.borrow_mut().release(self.slot);
    }
}

/// The complete storage image of one engine.
#[derive(Debug)]
pub struct Storage {
    symbol_table: LookupTable<String, ()>,
    globals_table: LookupTable<Atom, Atom>,
    string_table: ValueTable<String>,
    large_number_table: ValueTable<i64>,
    decimal_table: ValueTable<f64>,
    reference_table: ValueTable<Rc<dyn Reference>>,
    array_table: ValueTable<Rc<RefCell<Array>>>,
    cells: Vec<Cell>,
    states: Vec<CellState>,
    /// Index of the first free cell; `cells.len()` when none is free. A free
    /// cell stores the index of the next free cell as a raw word in its car.
    next_free: usize,
    cells_in_use: usize,
    gc_count: u64,
    gc_efficiency: SlidingAverage,
    roots: Rc<RefCell<RootSet>>,
    config: StorageConfig,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    pub fn with_config(config: StorageConfig) -> Self {
        let mut storage = Storage {
            symbol_table: LookupTable::new(),
            globals_table: LookupTable::new(),
            string_table: ValueTable::new(),
            large_number_table: ValueTable::new(),
            decimal_table: ValueTable::new(),
            reference_table: ValueTable::new(),
            array_table: ValueTable::new(),
            cells: Vec::new(),
            states: Vec::new(),
            next_free: 0,
            cells_in_use: 0,
            gc_count: 0,
            gc_efficiency: SlidingAverage::new(),
            roots: Rc::new(RefCell::new(RootSet::default())),
            config,
        };
        storage.initialize_symbols();
        storage
    }

    fn declare_fixed_symbol(&mut self, expected: Atom, name: &str) {
        let atom = self.make_symbol(name);
        debug_assert_eq!(atom, expected, "fixed symbol {name} out of order");
    }

    fn initialize_symbols(&mut self) {
        for &(expected, name) in RESERVED_SYMBOLS {
            self.declare_fixed_symbol(expected, name);
        }
    }

    // ------------------------------------------------------------------
    // Symbols and globals
    // ------------------------------------------------------------------

    /// Creates or looks up the symbol for the given name. Equal names always
    /// yield the same atom.
    pub fn make_symbol(&mut self, name: &str) -> Atom {
        let index = self.symbol_table.add(name.to_string(), ());
        Atom::tag_index(index, Tag::Symbol)
    }

    pub fn get_symbol_name(&self, symbol: Atom) -> &str {
        assert!(symbol.is_symbol(), "not a symbol: {symbol:?}");
        self.symbol_table.key(symbol.index())
    }

    /// Returns the global cell bound to the given name symbol, creating it
    /// (initialized to NIL) on first use.
    pub fn find_global(&mut self, name_symbol: Atom) -> Atom {
        assert!(name_symbol.is_symbol(), "global names must be symbols");
        let index = self.globals_table.add(name_symbol, Atom::NIL);
        Atom::tag_index(index, Tag::Global)
    }

    pub fn get_global_name(&self, global: Atom) -> &str {
        assert!(global.is_global());
        self.get_symbol_name(*self.globals_table.key(global.index()))
    }

    pub fn read_global(&self, global: Atom) -> Atom {
        assert!(global.is_global());
        *self.globals_table.value(global.index())
    }

    pub fn write_global(&mut self, global: Atom, value: Atom) {
        assert!(global.is_global());
        self.globals_table.set_value(global.index(), value);
    }

    // ------------------------------------------------------------------
    // Cells
    // ------------------------------------------------------------------

    /// Allocates a new cell. This is the only operation that can trigger a
    /// garbage collection; `car` and `cdr` are treated as roots while it
    /// runs, so the arguments are always safe to pass unrooted.
    pub fn make_cons(&mut self, car: Atom, cdr: Atom) -> Atom {
        if self.next_free >= self.cells.len() {
            if !self.cells.is_empty() {
                // Every n-th collection is a major one so the value tables
                // get reclaimed as well.
                if self.gc_count % self.config.max_minor_runs == 0 {
                    self.gc(true, car, cdr);
                } else {
                    self.gc(false, car, cdr);
                    if self.free_cells() < self.config.min_free_space {
                        self.gc(true, car, cdr);
                    }
                }
            }
            if self.free_cells() < self.config.min_free_space {
                self.extend_heap();
            }
        }

        let index = self.next_free;
        debug_assert_eq!(self.states[index], CellState::Unused);
        self.next_free = self.cells[index].car.raw() as usize;
        self.cells[index] = Cell { car, cdr };
        self.states[index] = CellState::Gray;
        self.cells_in_use += 1;
        Atom::tag_index(index, Tag::Cons)
    }

    fn extend_heap(&mut self) {
        let old_len = self.cells.len();
        let new_len = old_len + self.config.chunk_size;
        let filler = Cell {
            car: Atom::NIL,
            cdr: Atom::NIL,
        };
        self.cells.resize(new_len, filler);
        self.states.resize(new_len, CellState::Unused);
        // Thread the new block onto the free list. The last new cell links
        // to the old list head so cells freed before the extension stay
        // reachable; the old end-of-list sentinel (== old_len) would collide
        // with a valid index now and must be rewritten.
        let old_head = if self.next_free >= old_len {
            new_len
        } else {
            self.next_free
        };
        for index in old_len..new_len {
            let next = if index + 1 == new_len { old_head } else { index + 1 };
            self.cells[index].car = Atom::from_raw(next as u32);
        }
        self.next_free = old_len;
    }

    pub fn get_cons(&self, atom: Atom) -> Cell {
        assert!(atom.is_cons(), "not a cons: {atom:?}");
        self.cells[atom.index()]
    }

    pub fn set_car(&mut self, atom: Atom, car: Atom) {
        assert!(atom.is_cons());
        let index = atom.index();
        debug_assert_ne!(self.states[index], CellState::Unused, "write to freed cell");
        self.cells[index].car = car;
        // A minor collection may already have scanned this cell. Its
        // contents changed, so it has to be scanned again.
        if self.states[index] == CellState::Checked {
            self.states[index] = CellState::Referenced;
        }
    }

    pub fn set_cdr(&mut self, atom: Atom, cdr: Atom) {
        assert!(atom.is_cons());
        let index = atom.index();
        debug_assert_ne!(self.states[index], CellState::Unused, "write to freed cell");
        self.cells[index].cdr = cdr;
        if self.states[index] == CellState::Checked {
            self.states[index] = CellState::Referenced;
        }
    }

    /// Appends `next` to the cell `tail` points at and returns the atom of
    /// the freshly created cell. `tail` is pinned for the duration because
    /// the allocation may collect.
    pub fn append(&mut self, tail: Atom, next: Atom) -> Atom {
        let pinned = self.ref_atom(tail);
        let cell = self.make_cons(next, Atom::NIL);
        self.set_cdr(pinned.atom(), cell);
        cell
    }

    // ------------------------------------------------------------------
    // Boxed values
    // ------------------------------------------------------------------

    pub fn make_string(&mut self, value: impl Into<String>) -> Atom {
        let index = self.string_table.allocate(value.into());
        Atom::tag_index(index, Tag::String)
    }

    pub fn get_string(&self, atom: Atom) -> &str {
        assert!(atom.is_string(), "not a string: {atom:?}");
        self.string_table.get(atom.index())
    }

    /// Encodes a number, promoting it to the large-number table when it does
    /// not fit the 28-bit payload.
    pub fn make_number(&mut self, value: i64) -> Atom {
        if Atom::fits_small_number(value) {
            Atom::small_number(value)
        } else {
            let index = self.large_number_table.allocate(value);
            Atom::tag_index(index, Tag::LargeNumber)
        }
    }

    pub fn get_number(&self, atom: Atom) -> i64 {
        if atom.is_small_number() {
            atom.small_number_value()
        } else {
            assert!(atom.is_large_number(), "not a number: {atom:?}");
            *self.large_number_table.get(atom.index())
        }
    }

    pub fn make_decimal(&mut self, value: f64) -> Atom {
        let index = self.decimal_table.allocate(value);
        Atom::tag_index(index, Tag::Decimal)
    }

    pub fn get_decimal(&self, atom: Atom) -> f64 {
        assert!(atom.is_decimal(), "not a decimal: {atom:?}");
        *self.decimal_table.get(atom.index())
    }

    pub fn make_reference(&mut self, value: Rc<dyn Reference>) -> Atom {
        let index = self.reference_table.allocate(value);
        Atom::tag_index(index, Tag::Reference)
    }

    pub fn get_reference(&self, atom: Atom) -> Rc<dyn Reference> {
        assert!(atom.is_reference(), "not a reference: {atom:?}");
        Rc::clone(self.reference_table.get(atom.index()))
    }

    pub fn make_array(&mut self, size: usize) -> Atom {
        let index = self
            .array_table
            .allocate(Rc::new(RefCell::new(Array::new(size))));
        Atom::tag_index(index, Tag::Array)
    }

    pub fn get_array(&self, atom: Atom) -> Rc<RefCell<Array>> {
        assert!(atom.is_array(), "not an array: {atom:?}");
        Rc::clone(self.array_table.get(atom.index()))
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Registers a new strong root, initialized with the given atom.
    pub fn ref_atom(&mut self, atom: Atom) -> AtomRef {
        let slot = self.roots.borrow_mut().register(atom);
        AtomRef {
            slot,
            roots: Rc::clone(&self.roots),
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Runs a collection. `extra_root_a` and `extra_root_b` are treated as
    /// additional roots; [`Storage::make_cons`] passes its arguments here.
    ///
    /// A minor run reclaims only cells allocated since the previous
    /// collection (state `Gray`). A major run recolours the whole heap,
    /// recomputes the value-table reference counts and finally frees
    /// unreferenced boxed values.
    pub fn gc(&mut self, major: bool, extra_root_a: Atom, extra_root_b: Atom) {
        let mut queue: VecDeque<usize> = VecDeque::new();

        if major {
            self.string_table.reset_ref_counts();
            self.large_number_table.reset_ref_counts();
            self.decimal_table.reset_ref_counts();
            self.reference_table.reset_ref_counts();
            self.array_table.reset_ref_counts();
            for index in 0..self.array_table.len() {
                if self.array_table.in_use(index) {
                    self.array_table.get(index).borrow_mut().visited = false;
                }
            }
            for state in &mut self.states {
                *state = CellState::Gray;
            }
        }

        self.mark_root(extra_root_a, &mut queue);
        self.mark_root(extra_root_b, &mut queue);

        for index in 0..self.globals_table.len() {
            let value = *self.globals_table.value(index);
            self.mark_root(value, &mut queue);
        }

        let root_atoms: Vec<Atom> = self.roots.borrow().slots.clone();
        for atom in root_atoms {
            self.mark_root(atom, &mut queue);
        }

        self.mark(&mut queue);
        self.sweep();

        if major {
            self.string_table.gc();
            self.large_number_table.gc();
            self.decimal_table.gc();
            self.reference_table.gc();
            self.array_table.gc();
        }

        self.gc_count += 1;
    }

    fn mark_root(&mut self, atom: Atom, queue: &mut VecDeque<usize>) {
        if atom.is_cons() {
            self.states[atom.index()] = CellState::Referenced;
        } else {
            self.mark_value(atom, queue);
        }
    }

    /// Bumps the reference count behind a non-cons atom. Arrays are scanned
    /// once per collection (guarded by their `visited` flag) because their
    /// elements may point back into the cell heap.
    fn mark_value(&mut self, atom: Atom, queue: &mut VecDeque<usize>) {
        let index = atom.index();
        match atom.tag() {
            Tag::LargeNumber => self.large_number_table.inc(index),
            Tag::Decimal => self.decimal_table.inc(index),
            Tag::String => self.string_table.inc(index),
            Tag::Reference => self.reference_table.inc(index),
            Tag::Array => {
                self.array_table.inc(index);
                let array = Rc::clone(self.array_table.get(index));
                let elements = {
                    let mut array = array.borrow_mut();
                    if array.visited {
                        None
                    } else {
                        array.visited = true;
                        Some(array.elements().to_vec())
                    }
                };
                if let Some(elements) = elements {
                    for element in elements {
                        if element.is_cons() {
                            let element_index = element.index();
                            if self.states[element_index] != CellState::Checked {
                                self.states[element_index] = CellState::Referenced;
                                queue.push_back(element_index);
                            }
                        } else {
                            self.mark_value(element, queue);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Scans one reachable cell, enqueueing cons children that still need a
    /// visit. During the linear pass only backward edges are queued; the
    /// pass itself will reach forward edges anyway.
    fn mark_cell(&mut self, index: usize, queue: &mut VecDeque<usize>, always_queue: bool) {
        self.states[index] = CellState::Checked;
        let cell = self.cells[index];
        for child in [cell.car, cell.cdr] {
            if child.is_cons() {
                let child_index = child.index();
                if self.states[child_index] != CellState::Checked {
                    self.states[child_index] = CellState::Referenced;
                    if always_queue || child_index < index {
                        queue.push_back(child_index);
                    }
                }
            } else {
                self.mark_value(child, queue);
            }
        }
    }

    fn mark(&mut self, queue: &mut VecDeque<usize>) {
        for index in 0..self.cells.len() {
            if self.states[index] == CellState::Referenced {
                self.mark_cell(index, queue, false);
            }
        }
        while let Some(index) = queue.pop_front() {
            if self.states[index] == CellState::Referenced {
                self.mark_cell(index, queue, true);
            }
        }
    }

    /// Returns unreachable cells to the free list. Cells still `Gray` after
    /// marking were not reached from any root.
    fn sweep(&mut self) {
        self.next_free = self.cells.len();
        let mut free = 0;
        for index in 0..self.cells.len() {
            match self.states[index] {
                CellState::Unused | CellState::Gray => {
                    self.states[index] = CellState::Unused;
                    self.cells[index].car = Atom::from_raw(self.next_free as u32);
                    self.next_free = index;
                    free += 1;
                }
                CellState::Referenced | CellState::Checked => {}
            }
        }
        let live = self.cells.len() - free;
        let reclaimed = self.cells_in_use.saturating_sub(live);
        self.cells_in_use = live;
        if !self.cells.is_empty() {
            self.gc_efficiency
                .add(100.0 * reclaimed as f64 / self.cells.len() as f64);
        }
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn free_cells(&self) -> usize {
        self.cells.len() - self.cells_in_use
    }

    /// Walks the free list; used by diagnostics and the heap-integrity
    /// tests.
    pub fn free_list_length(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.next_free;
        while cursor < self.cells.len() {
            count += 1;
            cursor = self.cells[cursor].car.raw() as usize;
        }
        count
    }

    pub fn gc_count(&self) -> u64 {
        self.gc_count
    }

    pub fn gc_efficiency(&self) -> f64 {
        self.gc_efficiency.average()
    }

    pub fn num_gc_roots(&self) -> usize {
        self.roots.borrow().live()
    }

    pub fn num_symbols(&self) -> usize {
        self.symbol_table.len()
    }

    pub fn num_globals(&self) -> usize {
        self.globals_table.len()
    }

    pub fn total_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cells_used(&self) -> usize {
        self.cells_in_use
    }

    pub fn status(&self) -> StorageStatus {
        StorageStatus {
            num_gc_roots: self.num_gc_roots(),
            num_symbols: self.num_symbols(),
            num_globals: self.num_globals(),
            total_cells: self.total_cells(),
            cells_used: self.cells_used(),
            total_strings: self.string_table.len(),
            strings_used: self.string_table.used(),
            total_numbers: self.large_number_table.len(),
            numbers_used: self.large_number_table.used(),
            total_decimals: self.decimal_table.len(),
            decimals_used: self.decimal_table.used(),
            total_references: self.reference_table.len(),
            references_used: self.reference_table.used(),
            total_arrays: self.array_table.len(),
            arrays_used: self.array_table.used(),
        }
    }

}

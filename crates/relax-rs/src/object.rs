//! The object under layout: sections, bytecodes, and the symbol table.
//!
//! An [`Object`] is a list of sections, each an ordered run of bytecodes
//! starting with an empty head sentinel, plus a name-interned symbol table.
//! Callers build it up with the `append_*`/`define_*` methods, run
//! [`Object::finalize`] to resolve symbol references into locations, then
//! [`Object::optimize`] to fix every length and offset, and finally
//! [`Object::emit_section`] to render bytes.

use alloc::collections::BTreeMap;
#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
use alloc::string::ToString;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::bytecode::{BcId, BcKind, Bytecode, Contents, Location};
use crate::error::{Diagnostics, LayoutError};
use crate::expr::Expr;

/// Stable handle of an interned symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable handle of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SectionId(u32);

impl SectionId {
    /// Index of the section within the object.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How (and whether) a symbol is defined.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolDef {
    /// Referenced but never defined.
    Undefined,
    /// A label: defined at a layout location.
    Label(Location),
    /// An EQU: defined as an expression.
    Equ(Expr),
    /// Declared external; resolved by a later link step.
    External,
}

/// A named symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    name: String,
    def: SymbolDef,
    def_line: Option<u32>,
    use_line: Option<u32>,
}

impl Symbol {
    /// The symbol's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The symbol's definition.
    #[must_use]
    pub fn def(&self) -> &SymbolDef {
        &self.def
    }

    /// Line of the earliest recorded use, if any.
    #[must_use]
    pub fn use_line(&self) -> Option<u32> {
        self.use_line
    }

    /// Line of the definition, if defined.
    #[must_use]
    pub fn def_line(&self) -> Option<u32> {
        self.def_line
    }
}

/// An ordered run of bytecodes.  Distances are only computable between
/// locations of the same section.
#[derive(Debug)]
pub struct Section {
    name: String,
    pub(crate) bytecodes: Vec<Bytecode>,
    last_gap: bool,
}

impl Section {
    fn new(name: &str) -> Self {
        // Every section carries an empty head bytecode so that labels at
        // the section start have something to anchor to.
        Self {
            name: String::from(name),
            bytecodes: vec![Bytecode::empty(0)],
            last_gap: false,
        }
    }

    /// The section's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The section's bytecodes, head sentinel included.
    #[must_use]
    pub fn bytecodes(&self) -> &[Bytecode] {
        &self.bytecodes
    }
}

/// A container of sections with a symbol table.
#[derive(Debug, Default)]
pub struct Object {
    pub(crate) sections: Vec<Section>,
    symbols: Vec<Symbol>,
    by_name: BTreeMap<String, SymbolId>,
}

impl Object {
    /// Create an empty object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new (empty) section.
    pub fn add_section(&mut self, name: &str) -> SectionId {
        self.sections.push(Section::new(name));
        SectionId(self.sections.len() as u32 - 1)
    }

    /// All sections, in order.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// A section by handle.
    #[must_use]
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    /// A bytecode by handle.
    #[must_use]
    pub fn bc(&self, id: BcId) -> &Bytecode {
        &self.sections[id.sect as usize].bytecodes[id.idx as usize]
    }

    pub(crate) fn bc_mut(&mut self, id: BcId) -> &mut Bytecode {
        &mut self.sections[id.sect as usize].bytecodes[id.idx as usize]
    }

    /// Append a bytecode with the given contents.
    pub fn append(&mut self, sect: SectionId, contents: Contents, line: u32) -> BcId {
        let s = &mut self.sections[sect.index()];
        s.last_gap = false;
        s.bytecodes.push(Bytecode::new(contents, line));
        BcId {
            sect: sect.0,
            idx: s.bytecodes.len() as u32 - 1,
        }
    }

    /// Append fixed data bytes.
    pub fn append_data(&mut self, sect: SectionId, bytes: &[u8], line: u32) -> BcId {
        let s = &mut self.sections[sect.index()];
        s.last_gap = false;
        let mut bc = Bytecode::empty(line);
        bc.fixed.extend_from_slice(bytes);
        s.bytecodes.push(bc);
        BcId {
            sect: sect.0,
            idx: s.bytecodes.len() as u32 - 1,
        }
    }

    /// Append reserved space.  Consecutive gaps with the same fill byte are
    /// merged into one bytecode.
    pub fn append_gap(&mut self, sect: SectionId, size: u64, fill: u8, line: u32) -> BcId {
        let s = &mut self.sections[sect.index()];
        if s.last_gap {
            if let Some(bc) = s.bytecodes.last_mut() {
                if let Contents::Gap {
                    size: prev,
                    fill: prev_fill,
                } = &mut bc.contents
                {
                    if *prev_fill == fill {
                        *prev += size;
                        return BcId {
                            sect: sect.0,
                            idx: s.bytecodes.len() as u32 - 1,
                        };
                    }
                }
            }
        }
        s.bytecodes.push(Bytecode::new(Contents::Gap { size, fill }, line));
        s.last_gap = true;
        BcId {
            sect: sect.0,
            idx: s.bytecodes.len() as u32 - 1,
        }
    }

    /// The location at the current end of a section (where the next label
    /// or bytecode would land).
    #[must_use]
    pub fn last_loc(&self, sect: SectionId) -> Location {
        let s = &self.sections[sect.index()];
        Location {
            bc: BcId {
                sect: sect.0,
                idx: s.bytecodes.len() as u32 - 1,
            },
            off: 0,
        }
    }

    /// Intern `name`, recording `line` as a use site.
    pub fn use_symbol(&mut self, name: &str, line: u32) -> SymbolId {
        let id = self.intern(name);
        let sym = &mut self.symbols[id.index()];
        match sym.use_line {
            Some(prev) if prev <= line => {}
            _ => sym.use_line = Some(line),
        }
        id
    }

    /// Define `name` as a label at the current end of `sect`.
    pub fn define_label(
        &mut self,
        name: &str,
        sect: SectionId,
        line: u32,
    ) -> Result<SymbolId, LayoutError> {
        // A label pins this point: a later gap must not merge past it.
        self.sections[sect.index()].last_gap = false;
        let loc = self.last_loc(sect);
        let id = self.intern(name);
        let sym = &mut self.symbols[id.index()];
        if !matches!(sym.def, SymbolDef::Undefined) {
            return Err(LayoutError::DuplicateSymbol {
                name: String::from(name),
            });
        }
        sym.def = SymbolDef::Label(loc);
        sym.def_line = Some(line);
        self.bc_mut(loc.bc).symbols_here.push(id);
        Ok(id)
    }

    /// Define `name` as an expression (EQU).
    pub fn define_equ(
        &mut self,
        name: &str,
        expr: Expr,
        line: u32,
    ) -> Result<SymbolId, LayoutError> {
        let id = self.intern(name);
        let sym = &mut self.symbols[id.index()];
        if !matches!(sym.def, SymbolDef::Undefined) {
            return Err(LayoutError::DuplicateSymbol {
                name: String::from(name),
            });
        }
        sym.def = SymbolDef::Equ(expr);
        sym.def_line = Some(line);
        Ok(id)
    }

    /// Declare `name` external.
    pub fn declare_external(&mut self, name: &str, line: u32) -> SymbolId {
        let id = self.intern(name);
        let sym = &mut self.symbols[id.index()];
        if matches!(sym.def, SymbolDef::Undefined) {
            sym.def = SymbolDef::External;
            sym.def_line = Some(line);
        }
        id
    }

    /// A symbol by handle.
    #[must_use]
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    /// All interned symbols.
    #[must_use]
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: String::from(name),
            def: SymbolDef::Undefined,
            def_line: None,
            use_line: None,
        });
        self.by_name.insert(String::from(name), id);
        id
    }

    /// The address a location denotes: just past the end of its bytecode.
    /// Valid only after optimization (or for never-moved layouts).
    #[must_use]
    pub fn loc_offset(&self, loc: Location) -> u64 {
        self.bc(loc.bc).next_offset() + loc.off
    }

    /// Section offset of a symbol, when it has one (labels; constant EQUs).
    #[must_use]
    pub fn symbol_offset(&self, id: SymbolId) -> Option<u64> {
        match &self.symbols[id.index()].def {
            SymbolDef::Label(loc) => Some(self.loc_offset(*loc)),
            SymbolDef::Equ(expr) => expr.eval(self).map(|v| v as u64),
            SymbolDef::Undefined | SymbolDef::External => None,
        }
    }

    /// Resolve symbol references in all layout-dependent values and apply
    /// the undefined-symbol reporting policy.
    ///
    /// Must run before [`Object::optimize`].
    pub fn finalize(&mut self, diag: &mut Diagnostics) {
        let Object {
            sections, symbols, ..
        } = self;
        for sect in sections.iter_mut() {
            for bc in sect.bytecodes.iter_mut() {
                match &mut bc.contents {
                    Contents::Jump { target, .. } => target.resolve(symbols),
                    Contents::Times { count, .. } => count.resolve(symbols),
                    _ => {}
                }
            }
        }
        self.finalize_symbols(diag);
    }

    /// Report each used-but-undefined symbol once, at its earliest use.
    fn finalize_symbols(&self, diag: &mut Diagnostics) {
        let mut first_undef: Option<u32> = None;
        for sym in &self.symbols {
            if matches!(sym.def, SymbolDef::Undefined) {
                if let Some(line) = sym.use_line {
                    diag.error(line, format!("undefined symbol '{}' (first use)", sym.name));
                    first_undef = Some(first_undef.map_or(line, |f| f.min(line)));
                }
            }
        }
        if let Some(line) = first_undef {
            diag.error(line, " (Each undefined symbol is reported only once.)");
        }
    }

    /// Re-derive every bytecode offset from its predecessor.  Offset-setting
    /// bytecodes recompute their tail from the assigned offset.
    pub(crate) fn update_offsets(&mut self, diag: &mut Diagnostics) {
        for sect in &mut self.sections {
            let mut offset = 0u64;
            for bc in &mut sect.bytecodes {
                bc.set_offset(offset);
                if bc.classify() == BcKind::OffsetSetting {
                    if let Err(err) = bc.refresh_offset_tail() {
                        diag.error(bc.line(), err.to_string());
                        return;
                    }
                }
                offset = bc.next_offset();
            }
        }
    }

    /// Render a section's bytes.  Valid only after optimization.
    pub fn emit_section(&self, sect: SectionId) -> Result<Vec<u8>, LayoutError> {
        let s = &self.sections[sect.index()];
        let total = s.bytecodes.last().map_or(0, Bytecode::next_offset);
        let mut out = Vec::with_capacity(total as usize);
        for (bi, bc) in s.bytecodes.iter().enumerate() {
            let id = BcId {
                sect: sect.0,
                idx: bi as u32,
            };
            out.extend_from_slice(&bc.fixed);
            bc.emit_tail(self, id, &mut out)?;
        }
        Ok(out)
    }
}

use paste::paste;

use crate::ir::{
    cfg::CFG,
    global::Linkage,
    idmap::{
        idmap_functions,
        HasId,
        HasIdMut,
        Id,
        IdMap,
        IdMapValues,
        IdMapValuesMut,
    },
    register::{
        link_register,
        PhysReg,
        RegClass,
        VirtReg,
    },
    types::Type,
};

/// An object in the stack frame of a function
#[derive(Debug, Clone)]
pub struct StackObject {
    id: Id,
    name: String,
    ty: Option<Type>,
    size: usize,
    align: usize,
    variable_sized: bool,
}

impl HasId for StackObject {
    fn id(&self) -> Id {
        self.id
    }
}

impl HasIdMut for StackObject {
    fn id_mut(&mut self) -> &mut Id {
        &mut self.id
    }
}

impl StackObject {
    /// A stack object of fixed size
    pub fn new<S: Into<String>>(name: S, ty: Option<Type>, size: usize, align: usize) -> Self {
        Self {
            id: Id::default(),
            name: name.into(),
            ty,
            size,
            align,
            variable_sized: false,
        }
    }

    /// A stack object whose size is only known at runtime (`alloca` with a dynamic count)
    pub fn variable_sized<S: Into<String>>(name: S, ty: Option<Type>, align: usize) -> Self {
        Self {
            id: Id::default(),
            name: name.into(),
            ty,
            size: 0,
            align,
            variable_sized: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type of the allocated memory if known
    pub fn ty(&self) -> Option<&Type> {
        self.ty.as_ref()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn is_variable_sized(&self) -> bool {
        self.variable_sized
    }
}

/// The stack frame of a function
#[derive(Debug, Clone)]
pub struct FrameInfo {
    objects: IdMap<StackObject>,
}

idmap_functions!(FrameInfo, objects, StackObject, object);

impl FrameInfo {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            objects: IdMap::new(),
        }
    }

    /// Add a stack object and return its frame index
    pub fn add_object(&mut self, object: StackObject) -> Id {
        self.objects.insert(object)
    }

    /// Remove a stack object from the frame
    pub fn remove_object(&mut self, id: Id) -> Option<StackObject> {
        self.objects.remove(id)
    }
}

/// Bookkeeping of the virtual registers of a function
#[derive(Debug, Clone)]
pub struct RegisterInfo {
    classes: Vec<RegClass>,
    allocated: bool,
}

impl RegisterInfo {
    fn new(allocated: bool) -> Self {
        Self {
            classes: Vec::new(),
            allocated,
        }
    }

    /// Create a fresh virtual register of the given class
    pub fn create_virtual(&mut self, class: RegClass) -> VirtReg {
        let reg = VirtReg::new(self.classes.len());
        self.classes.push(class);
        reg
    }

    /// The register class of `reg`
    pub fn class_of(&self, reg: VirtReg) -> Option<RegClass> {
        self.classes.get(reg.number()).copied()
    }

    /// Restrict the class of `reg` to the common subclass of its current class and `class`.
    /// Returns the new class or `None` if the classes are incompatible (the class then stays unchanged).
    pub fn constrain(&mut self, reg: VirtReg, class: RegClass) -> Option<RegClass> {
        let current = self.classes.get_mut(reg.number())?;
        let common = current.common_subclass(class)?;
        *current = common;
        Some(common)
    }

    pub fn num_virtuals(&self) -> usize {
        self.classes.len()
    }

    /// Whether registers have been allocated already, i.e. no virtual registers may be used anymore
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }
}

/// A machine function
#[derive(Debug, Clone)]
pub struct Function {
    id: Id,
    name: String,
    cfg: Option<CFG>,
    address_taken: bool,
    callee_saved: Option<Vec<PhysReg>>,
    frame: FrameInfo,
    regs: RegisterInfo,
    naked: bool,
    linkage: Linkage,
}

impl HasId for Function {
    fn id(&self) -> Id {
        self.id
    }
}

impl HasIdMut for Function {
    fn id_mut(&mut self) -> &mut Id {
        &mut self.id
    }
}

impl Function {
    /// Create a builder for a function
    pub fn builder() -> FunctionBuilder {
        FunctionBuilder {
            name: None,
            cfg: None,
            address_taken: false,
            callee_saved: None,
            frame: FrameInfo::new(),
            naked: false,
            linkage: Linkage::External,
            allocated: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The body of this function. Declarations have no body.
    pub fn cfg(&self) -> Option<&CFG> {
        self.cfg.as_ref()
    }

    pub fn cfg_mut(&mut self) -> Option<&mut CFG> {
        self.cfg.as_mut()
    }

    /// Replace the body of this function
    pub fn set_cfg(&mut self, cfg: CFG) {
        self.cfg = Some(cfg);
    }

    pub fn has_body(&self) -> bool {
        self.cfg.is_some()
    }

    /// Whether the address of this function is used somewhere else than in a direct call
    pub fn is_address_taken(&self) -> bool {
        self.address_taken
    }

    pub fn set_address_taken(&mut self, address_taken: bool) {
        self.address_taken = address_taken;
    }

    /// The callee-saved registers spilled in the prologue. `None` if not finalized yet.
    pub fn callee_saved(&self) -> Option<&[PhysReg]> {
        self.callee_saved.as_deref()
    }

    pub fn set_callee_saved(&mut self, regs: Vec<PhysReg>) {
        self.callee_saved = Some(regs);
    }

    /// Whether the link register is spilled to the stack in the prologue
    pub fn saves_link_register(&self) -> bool {
        self.callee_saved.as_ref().map(|regs| regs.contains(&link_register)).unwrap_or(false)
    }

    pub fn frame(&self) -> &FrameInfo {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut FrameInfo {
        &mut self.frame
    }

    pub fn regs(&self) -> &RegisterInfo {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut RegisterInfo {
        &mut self.regs
    }

    /// Naked functions have no prologue or epilogue
    pub fn is_naked(&self) -> bool {
        self.naked
    }

    pub fn set_naked(&mut self, naked: bool) {
        self.naked = naked;
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn set_linkage(&mut self, linkage: Linkage) {
        self.linkage = linkage;
    }

    /// Encoded size of the body in bytes
    pub fn size(&self) -> usize {
        self.cfg.as_ref().map(|cfg| cfg.size()).unwrap_or(0)
    }
}

/// Builds a [`Function`]. Only the name is mandatory.
pub struct FunctionBuilder {
    name: Option<String>,
    cfg: Option<CFG>,
    address_taken: bool,
    callee_saved: Option<Vec<PhysReg>>,
    frame: FrameInfo,
    naked: bool,
    linkage: Linkage,
    allocated: bool,
}

impl FunctionBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn cfg(mut self, cfg: CFG) -> Self {
        self.cfg = Some(cfg);
        self
    }

    pub fn address_taken(mut self, address_taken: bool) -> Self {
        self.address_taken = address_taken;
        self
    }

    pub fn callee_saved(mut self, regs: Vec<PhysReg>) -> Self {
        self.callee_saved = Some(regs);
        self
    }

    pub fn frame(mut self, frame: FrameInfo) -> Self {
        self.frame = frame;
        self
    }

    pub fn naked(mut self, naked: bool) -> Self {
        self.naked = naked;
        self
    }

    pub fn linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    /// Mark the function as register-allocated. It may not use virtual registers.
    pub fn allocated(mut self, allocated: bool) -> Self {
        self.allocated = allocated;
        self
    }

    pub fn build(self) -> Result<Function, &'static str> {
        let name = self.name.ok_or("Function has no name")?;

        if let Some(cfg) = &self.cfg {
            if cfg.num_basic_blocks() == 0 {
                return Err("Function body has no basic blocks");
            }
        }

        Ok(Function {
            id: Id::default(),
            name,
            cfg: self.cfg,
            address_taken: self.address_taken,
            callee_saved: self.callee_saved,
            frame: self.frame,
            regs: RegisterInfo::new(self.allocated),
            naked: self.naked,
            linkage: self.linkage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constrain() {
        let mut func = Function::builder().name("f").build().unwrap();
        let v = func.regs_mut().create_virtual(RegClass::LowGpr);

        assert_eq!(func.regs_mut().constrain(v, RegClass::TailCall), Some(RegClass::LowTailCall));
        assert_eq!(func.regs().class_of(v), Some(RegClass::LowTailCall));
        assert_eq!(func.regs().num_virtuals(), 1);
    }

    #[test]
    fn test_saves_link_register() {
        let mut func = Function::builder().name("f").build().unwrap();
        assert!(!func.saves_link_register());
        func.set_callee_saved(vec![PhysReg::r4, PhysReg::lr]);
        assert!(func.saves_link_register());
        assert!(!func.has_body());
    }
}

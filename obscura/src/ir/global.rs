use crate::ir::{
    idmap::{
        HasId,
        HasIdMut,
        Id,
    },
    pointer::Pointer,
    types::Type,
};

/// Symbol linkage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Linkage {
    #[default]
    External,
    Internal,
    /// Internal and not present in the symbol table
    Private,
    /// Merged with other definitions of the same name at link time
    LinkOnce,
}

/// The initial content of a global object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Initializer {
    /// All bytes are zero
    Zero,
    /// Raw bytes
    Bytes(Vec<u8>),
    /// An array of pointer-sized entries
    Pointers(Vec<Pointer>),
}

impl Initializer {
    /// Whether every byte of this initializer is zero
    pub fn is_zero(&self) -> bool {
        match self {
            Initializer::Zero => true,
            Initializer::Bytes(bytes) => bytes.iter().all(|b| *b == 0),
            Initializer::Pointers(pointers) => pointers.iter().all(|p| matches!(p, Pointer::Null | Pointer::Raw(0))),
        }
    }

    /// The pointer entries that refer to other symbols
    pub fn pointers(&self) -> &[Pointer] {
        match self {
            Initializer::Pointers(pointers) => pointers,
            _ => &[],
        }
    }
}

/// A global variable or constant
#[derive(Debug, Clone)]
pub struct GlobalObject {
    id: Id,
    name: String,
    size: usize,
    align: usize,
    constant: bool,
    initializer: Option<Initializer>,
    section: Option<String>,
    linkage: Linkage,
    decoy: bool,
    ty: Option<Type>,
}

impl HasId for GlobalObject {
    fn id(&self) -> Id {
        self.id
    }
}

impl HasIdMut for GlobalObject {
    fn id_mut(&mut self) -> &mut Id {
        &mut self.id
    }
}

impl GlobalObject {
    /// Create a builder for a global object
    pub fn builder() -> GlobalObjectBuilder {
        GlobalObjectBuilder {
            name: None,
            size: None,
            align: 1,
            constant: false,
            initializer: None,
            section: None,
            linkage: Linkage::External,
            ty: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment in bytes
    pub fn align(&self) -> usize {
        self.align
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// The initializer. `None` means that this is an external declaration.
    pub fn initializer(&self) -> Option<&Initializer> {
        self.initializer.as_ref()
    }

    pub fn is_declaration(&self) -> bool {
        self.initializer.is_none()
    }

    /// The explicitly requested output section
    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    /// Whether this object was synthesized by the layout randomizer
    pub fn is_decoy(&self) -> bool {
        self.decoy
    }

    pub(crate) fn set_decoy(&mut self, decoy: bool) {
        self.decoy = decoy;
    }

    pub fn ty(&self) -> Option<&Type> {
        self.ty.as_ref()
    }
}

/// Builds a [`GlobalObject`]. `name` and `size` are mandatory.
pub struct GlobalObjectBuilder {
    name: Option<String>,
    size: Option<usize>,
    align: usize,
    constant: bool,
    initializer: Option<Initializer>,
    section: Option<String>,
    linkage: Linkage,
    ty: Option<Type>,
}

impl GlobalObjectBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub fn constant(mut self, constant: bool) -> Self {
        self.constant = constant;
        self
    }

    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn section<S: Into<String>>(mut self, section: S) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn ty(mut self, ty: Type) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn build(self) -> Result<GlobalObject, &'static str> {
        let name = self.name.ok_or("Global object has no name")?;
        let size = self.size.ok_or("Global object has no size")?;

        if self.align == 0 || !self.align.is_power_of_two() {
            return Err("Alignment of global object is not a power of two");
        }

        Ok(GlobalObject {
            id: Id::default(),
            name,
            size,
            align: self.align,
            constant: self.constant,
            initializer: self.initializer,
            section: self.section,
            linkage: self.linkage,
            decoy: false,
            ty: self.ty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        assert!(GlobalObject::builder().size(4).build().is_err());
        assert!(GlobalObject::builder().name("x").build().is_err());
        assert!(GlobalObject::builder().name("x").size(4).align(3).build().is_err());

        let global = GlobalObject::builder().name("x").size(4).align(4).build().unwrap();
        assert!(global.is_declaration());
        assert!(!global.is_decoy());
    }

    #[test]
    fn test_zero_initializer() {
        assert!(Initializer::Zero.is_zero());
        assert!(Initializer::Bytes(vec![0; 8]).is_zero());
        assert!(!Initializer::Bytes(vec![0, 1]).is_zero());
        assert!(Initializer::Pointers(vec![Pointer::Null, Pointer::Raw(0)]).is_zero());
        assert!(!Initializer::Pointers(vec![Pointer::Raw(1)]).is_zero());
    }
}

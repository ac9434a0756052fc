/// Memory types of stack objects and globals
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// An integer with the given number of bits
    Int(usize),
    /// A data pointer
    Pointer,
    /// A pointer to a function
    FunctionPointer,
    /// `n` elements of the same type
    Array(Box<Type>, usize),
    /// Fields laid out with their natural alignment
    Struct(Vec<Type>),
}

impl Type {
    /// Size in bytes (including padding) for a target with `ptr`-byte pointers
    pub fn size(&self, ptr: usize) -> usize {
        match self {
            Type::Int(bits) => bits.div_ceil(8),
            Type::Pointer | Type::FunctionPointer => ptr,
            Type::Array(elem, n) => elem.size(ptr) * n,
            Type::Struct(fields) => {
                let mut offset = 0;

                for field in fields {
                    offset = align_up(offset, field.align(ptr)) + field.size(ptr);
                }

                align_up(offset, self.align(ptr))
            },
        }
    }

    /// Alignment in bytes
    pub fn align(&self, ptr: usize) -> usize {
        match self {
            Type::Int(bits) => bits.div_ceil(8).next_power_of_two().min(8),
            Type::Pointer | Type::FunctionPointer => ptr,
            Type::Array(elem, _) => elem.align(ptr),
            Type::Struct(fields) => fields.iter().map(|f| f.align(ptr)).max().unwrap_or(1),
        }
    }

    /// Whether a function pointer is stored somewhere inside this type
    pub fn contains_function_pointer(&self) -> bool {
        match self {
            Type::FunctionPointer => true,
            Type::Int(_) | Type::Pointer => false,
            Type::Array(elem, _) => elem.contains_function_pointer(),
            Type::Struct(fields) => fields.iter().any(|f| f.contains_function_pointer()),
        }
    }

    /// Byte offsets of all function pointer slots inside this type
    pub fn function_pointer_offsets(&self, ptr: usize) -> Vec<usize> {
        let mut offsets = Vec::new();
        self.collect_function_pointers(ptr, 0, &mut offsets);
        offsets
    }

    fn collect_function_pointers(&self, ptr: usize, base: usize, offsets: &mut Vec<usize>) {
        match self {
            Type::FunctionPointer => offsets.push(base),
            Type::Int(_) | Type::Pointer => {},
            Type::Array(elem, n) => {
                if elem.contains_function_pointer() {
                    let size = elem.size(ptr);

                    for i in 0..*n {
                        elem.collect_function_pointers(ptr, base + i * size, offsets);
                    }
                }
            },
            Type::Struct(fields) => {
                let mut offset = 0;

                for field in fields {
                    offset = align_up(offset, field.align(ptr));
                    field.collect_function_pointers(ptr, base + offset, offsets);
                    offset += field.size(ptr);
                }
            },
        }
    }
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

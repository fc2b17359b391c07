/// Scalar component type of accessor data.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ComponentType {
    I8,
    U8,
    I16,
    U16,
    U32,
    F32,
}

impl ComponentType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ComponentType::I8 | ComponentType::U8 => 1,
            ComponentType::I16 | ComponentType::U16 => 2,
            ComponentType::U32 | ComponentType::F32 => 4,
        }
    }
}

impl From<gltf::accessor::DataType> for ComponentType {
    fn from(value: gltf::accessor::DataType) -> Self {
        match value {
            gltf::accessor::DataType::I8 => ComponentType::I8,
            gltf::accessor::DataType::U8 => ComponentType::U8,
            gltf::accessor::DataType::I16 => ComponentType::I16,
            gltf::accessor::DataType::U16 => ComponentType::U16,
            gltf::accessor::DataType::U32 => ComponentType::U32,
            gltf::accessor::DataType::F32 => ComponentType::F32,
        }
    }
}

/// Components per element for an accessor shape.
pub fn component_count(dimensions: gltf::accessor::Dimensions) -> usize {
    match dimensions {
        gltf::accessor::Dimensions::Scalar => 1,
        gltf::accessor::Dimensions::Vec2 => 2,
        gltf::accessor::Dimensions::Vec3 => 3,
        gltf::accessor::Dimensions::Vec4 => 4,
        gltf::accessor::Dimensions::Mat2 => 4,
        gltf::accessor::Dimensions::Mat3 => 9,
        gltf::accessor::Dimensions::Mat4 => 16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_sizes() {
        assert_eq!(ComponentType::U8.size_in_bytes(), 1);
        assert_eq!(ComponentType::U16.size_in_bytes(), 2);
        assert_eq!(ComponentType::F32.size_in_bytes(), 4);
    }
}

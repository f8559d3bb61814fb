use anyhow::Context;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng; // 用于生成私钥的安全随机数生成器
use std::path::Path;
use tracing::info;

use crate::error::PersistenceError;
use crate::evidence::AuditLeaf;

/// 签名器模块
/// 负责对检测结果的审计叶子进行签名，证明“这条结论出自本服务”
pub struct EvidenceSigner {
    keypair: SigningKey,
}

impl EvidenceSigner {
    /// 每次生成新密钥 (测试 / 临时运行)
    pub fn new() -> Self {
        let keypair = SigningKey::generate(&mut OsRng);
        Self { keypair }
    }

    /// 从文件加载私钥 (64 个 Hex 字符)，不存在则生成并写入
    pub fn load_or_generate(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("读取密钥失败: {}", path.display()))?;
            let bytes = hex::decode(raw.trim()).context("密钥文件不是合法的 Hex")?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("密钥长度必须是 32 字节"))?;
            info!("🔑 已加载签名密钥: {}", path.display());
            return Ok(Self {
                keypair: SigningKey::from_bytes(&secret),
            });
        }

        let signer = Self::new();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(signer.keypair.to_bytes()))
            .with_context(|| format!("写入密钥失败: {}", path.display()))?;
        info!("🔑 已生成新的签名密钥: {}", path.display());
        Ok(signer)
    }

    /// 获取公钥（用于分发给审计方进行验签）
    pub fn public_key(&self) -> VerifyingKey {
        self.keypair.verifying_key()
    }

    /// 对审计叶子的 BCS 编码签名，返回 64 字节 Ed25519 签名
    pub fn sign(&self, leaf: &AuditLeaf) -> Result<Signature, PersistenceError> {
        let payload = leaf.encode()?;
        Ok(self.keypair.sign(&payload))
    }

    /// 静态验证函数（给外部验证者使用）
    pub fn verify(
        verification_key: &VerifyingKey,
        leaf: &AuditLeaf,
        signature: &Signature,
    ) -> Result<bool, PersistenceError> {
        let payload = leaf.encode()?;
        Ok(verification_key.verify(&payload, signature).is_ok())
    }
}

impl Default for EvidenceSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::tests::sample_result;

    #[test]
    fn signature_covers_the_decision() {
        let signer = EvidenceSigner::new();
        let leaf = AuditLeaf::from_result(&sample_result(b"page"));
        let signature = signer.sign(&leaf).unwrap();
        assert!(EvidenceSigner::verify(&signer.public_key(), &leaf, &signature).unwrap());

        let mut forged = leaf.clone();
        forged.verdict = !forged.verdict;
        assert!(!EvidenceSigner::verify(&signer.public_key(), &forged, &signature).unwrap());
    }

    #[test]
    fn key_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("shield.key");
        let first = EvidenceSigner::load_or_generate(&path).unwrap();
        let second = EvidenceSigner::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }
}
